//! BSD-style `traceroute` output: hop numbers live in the first three
//! columns, continuation lines leave them blank.

use std::net::IpAddr;

use crate::errors::ParseError;

use super::line_by_line::{clean_token, LineAccumulator};
use super::{extract_rtt_from_str, HopMap, Parser};

pub struct BsdParser;

impl Parser for BsdParser {
    fn description(&self) -> &'static str {
        "BSD-like traceroute format"
    }

    fn parse(&self, raw: &str) -> Result<HopMap, ParseError> {
        parse_bsd_like(raw)
    }
}

pub(super) fn parse_bsd_like(raw: &str) -> Result<HopMap, ParseError> {
    let mut acc = LineAccumulator::new();

    let mut last_hop_n: u32 = 0;

    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }

        if line.starts_with("traceroute to ") {
            continue;
        }

        // The first column holds the hop number:
        //  4  10.254.0.217 (10.254.0.217)  15.234 ms  15.081 ms
        //     10.254.0.221 (10.254.0.221)  13.549 ms
        // ^^^
        let beginning_of_line: String = line.chars().take(3).collect();
        let beginning_of_line = beginning_of_line.trim();

        let this_hop_n = if !beginning_of_line.is_empty() {
            match beginning_of_line.parse::<u32>() {
                Ok(0) => continue,
                Ok(n) => {
                    if n != last_hop_n + 1 {
                        return Err(ParseError::new(format!(
                            "unexpected hop n.: found {n}, previous was {last_hop_n}"
                        )));
                    }
                    n
                }
                // Not a hop line (e.g. a wrapped hostname); treat it as a
                // continuation of the current hop.
                Err(_) => last_hop_n,
            }
        } else {
            last_hop_n
        };

        let rest: String = line.chars().skip(3).collect();

        let mut ip: Option<IpAddr> = None;
        let mut rtts: Vec<f64> = Vec::new();
        let mut missing_replies = 0u32;

        for col in rest.split_whitespace() {
            let val = clean_token(col);

            if val == "ms" {
                continue;
            }

            if val == "*" {
                missing_replies += 1;
                continue;
            }

            if let Ok(parsed) = val.parse::<IpAddr>() {
                ip = Some(parsed);
                continue;
            }

            if let Ok(rtt) = extract_rtt_from_str(&val) {
                rtts.push(rtt);
            }
        }

        if this_hop_n > 0 {
            match ip {
                Some(ip) => {
                    if rtts.is_empty() && missing_replies == 0 {
                        return Err(ParseError::new(format!(
                            "IP {ip} was found while parsing '{line}' but with \
                             no missing replies nor RTT values"
                        )));
                    }

                    acc.add_host(this_hop_n, ip.to_string(), &rtts)?;
                }
                None => {
                    if missing_replies == 0 {
                        return Err(ParseError::new(format!(
                            "no IP was found while parsing line '{line}', but \
                             also no missing replies were found"
                        )));
                    }

                    acc.add_missing(this_hop_n)?;
                }
            }

            last_hop_n = this_hop_n;
        }
    }

    acc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traceroute::parsers::parse_and_validate;

    pub(crate) const BSD: &str = "\
traceroute to 8.8.8.8 (8.8.8.8), 64 hops max, 40 byte packets
 1  192.168.1.254 (192.168.1.254)  4.658 ms  3.381 ms  3.160 ms
 2  10.1.131.181 (10.1.131.181)  10.212 ms  9.542 ms  9.429 ms
 3  * * *
 4  10.254.0.217 (10.254.0.217)  15.234 ms  15.081 ms
    10.254.0.221 (10.254.0.221)  13.549 ms
 5  8.8.8.8 (8.8.8.8)  21.834 ms  21.398 ms  21.686 ms
";

    #[test]
    fn basic_bsd_output() {
        let hops = parse_and_validate(&BsdParser, BSD).unwrap();

        assert_eq!(hops.len(), 5);
        assert_eq!(hops[&1][0].host, "192.168.1.254");
        assert_eq!(hops[&1][0].min_rtt, Some(3.16));
        assert!(hops[&3].is_empty());

        // The continuation line belongs to hop 4.
        let h4 = &hops[&4];
        assert_eq!(h4.len(), 2);
        assert_eq!(h4[0].host, "10.254.0.217");
        assert_eq!(h4[1].host, "10.254.0.221");
        assert_eq!(h4[1].avg_rtt, Some(13.549));
    }

    #[test]
    fn partial_replies_on_a_hop() {
        let raw = "\
 1  192.168.1.254 (192.168.1.254)  4.658 ms * 3.160 ms
";
        let hops = parse_and_validate(&BsdParser, raw).unwrap();
        assert_eq!(hops[&1][0].avg_rtt, Some(3.909));
    }

    #[test]
    fn hop_number_gap_is_rejected() {
        let raw = "\
 1  192.168.1.254 (192.168.1.254)  4.658 ms
 3  10.0.0.1 (10.0.0.1)  9.542 ms
";
        assert!(BsdParser.parse(raw).is_err());
    }
}
