//! Linux `traceroute` output. Hostnames and IPs may both appear, multiple
//! hosts can share a hop, and a host's replies may continue on the next
//! line.

use std::net::IpAddr;

use crate::errors::ParseError;

use super::line_by_line::{clean_token, LineAccumulator};
use super::{extract_rtt_from_str, looks_like_a_hostname, HopMap, Parser};

pub struct LinuxParser;

impl Parser for LinuxParser {
    fn description(&self) -> &'static str {
        "Linux-like traceroute format"
    }

    fn parse(&self, raw: &str) -> Result<HopMap, ParseError> {
        let mut acc = LineAccumulator::new();

        let mut last_hop_n: u32 = 0;

        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }

            if line.starts_with("traceroute to ") || line.starts_with("traceroute6 to ") {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            let Some(&hop_n_raw) = parts.first() else {
                continue;
            };

            let Ok(this_hop_n) = hop_n_raw.parse::<u32>() else {
                continue;
            };

            if this_hop_n == 0 {
                continue;
            }

            if this_hop_n != last_hop_n && this_hop_n != last_hop_n + 1 {
                return Err(ParseError::new(format!(
                    "unexpected hop n.: found {this_hop_n}, previous was {last_hop_n}"
                )));
            }

            // Several hosts (each with its own replies) may share the
            // line:
            // 5  185.235.236.4 (185.235.236.4)  1.620 ms  1.228 ms
            //    185.235.236.8 (185.235.236.8)  1.606 ms
            let mut last_ip: Option<IpAddr> = None;
            let mut hostname: Option<String> = None;
            let mut got_rtts = false;
            let mut missing_replies = 0u32;

            for part in &parts[1..] {
                let val = clean_token(part);

                if val == "ms" {
                    continue;
                }

                if val == "*" {
                    missing_replies += 1;
                    continue;
                }

                if let Ok(ip) = val.parse::<IpAddr>() {
                    last_ip = Some(ip);
                    continue;
                }

                if let Ok(rtt) = extract_rtt_from_str(&val) {
                    got_rtts = true;

                    // Each RTT belongs to the host seen most recently on
                    // the line.
                    if let Some(ip) = last_ip {
                        acc.add_host(this_hop_n, ip.to_string(), &[rtt])?;
                    } else if let Some(name) = &hostname {
                        acc.add_host(this_hop_n, name.clone(), &[rtt])?;
                    } else {
                        return Err(ParseError::new(format!(
                            "RTT {rtt} found, but last host not determined"
                        )));
                    }

                    continue;
                }

                // Not an IP, not an RTT: could be the hostname column.
                if hostname.is_none() && looks_like_a_hostname(&val) {
                    hostname = Some(val);
                }
            }

            if last_ip.is_some() || hostname.is_some() {
                if !got_rtts && missing_replies == 0 {
                    return Err(ParseError::new(format!(
                        "a host was found while parsing '{line}' but with \
                         no missing replies nor RTT values"
                    )));
                }
            } else if missing_replies == 0 {
                return Err(ParseError::new(format!(
                    "no IP was found while parsing line '{line}', but \
                     also no missing replies were found"
                )));
            } else {
                acc.add_missing(this_hop_n)?;
            }

            last_hop_n = this_hop_n;
        }

        acc.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traceroute::parsers::parse_and_validate;

    pub(crate) const LINUX: &str = "\
traceroute to 8.8.8.8 (8.8.8.8), 30 hops max, 60 byte packets
 1  gw.lan (192.168.1.254)  3.560 ms  3.521 ms  3.510 ms
 2  10.1.131.181 (10.1.131.181)  9.128 ms  9.121 ms  9.224 ms
 3  * * *
 4  185.235.236.4 (185.235.236.4)  1.620 ms  1.228 ms 185.235.236.8 (185.235.236.8)  1.606 ms
 5  dns.google (8.8.8.8)  22.763 ms  22.447 ms  22.337 ms
";

    #[test]
    fn hostnames_ips_and_multi_host_hops() {
        let hops = parse_and_validate(&LinuxParser, LINUX).unwrap();

        assert_eq!(hops.len(), 5);

        // "gw.lan (192.168.1.254)": the IP wins, RTTs attach to it.
        let h1 = &hops[&1];
        assert_eq!(h1.len(), 1);
        assert_eq!(h1[0].host, "192.168.1.254");
        assert_eq!(h1[0].avg_rtt, Some(3.53));
        assert_eq!(h1[0].min_rtt, Some(3.51));
        assert_eq!(h1[0].max_rtt, Some(3.56));
        assert_eq!(h1[0].loss, None);

        assert!(hops[&3].is_empty());

        // Two hosts replied at hop 4 on the same line.
        let h4 = &hops[&4];
        assert_eq!(h4.len(), 2);
        assert_eq!(h4[0].host, "185.235.236.4");
        assert_eq!(h4[1].host, "185.235.236.8");
        assert_eq!(h4[1].avg_rtt, Some(1.606));
    }

    #[test]
    fn hostname_only_hop() {
        let raw = "\
 1  core1-lns.example.net  1.0 ms  2.0 ms
";
        let hops = parse_and_validate(&LinuxParser, raw).unwrap();
        assert_eq!(hops[&1][0].host, "core1-lns.example.net");
        assert_eq!(hops[&1][0].avg_rtt, Some(1.5));
    }

    #[test]
    fn hop_number_gap_is_rejected() {
        let raw = "\
 1  192.168.1.254  1.0 ms
 3  10.0.0.1  2.0 ms
";
        assert!(LinuxParser.parse(raw).is_err());
    }
}
