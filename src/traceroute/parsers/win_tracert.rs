//! Windows `tracert` output: RTT columns come before the host, which may
//! be an IP or `hostname [ip]`.

use std::net::IpAddr;

use crate::errors::ParseError;

use super::line_by_line::LineAccumulator;
use super::{extract_rtt_from_str, HopMap, Parser};

pub struct WindowsTracertParser;

impl Parser for WindowsTracertParser {
    fn description(&self) -> &'static str {
        "Windows tracert"
    }

    fn parse(&self, raw: &str) -> Result<HopMap, ParseError> {
        let mut acc = LineAccumulator::new();

        let mut last_hop_n: u32 = 0;

        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            let Some(&hop_n_raw) = parts.first() else {
                continue;
            };

            let Ok(this_hop_n) = hop_n_raw.parse::<u32>() else {
                continue;
            };

            if this_hop_n != last_hop_n + 1 {
                return Err(ParseError::new(format!(
                    "unexpected hop n.: found {this_hop_n}, previous was {last_hop_n}"
                )));
            }

            //   3    12 ms    11 ms    12 ms  host.example.net [10.0.0.1]
            let mut rtts: Vec<f64> = Vec::new();
            let mut missing_replies = 0u32;

            for part in &parts[1..] {
                let val = part
                    .replace(['[', ']'], "")
                    .replace("^C", "")
                    .trim()
                    .to_string();

                if val == "ms" {
                    continue;
                }

                if val == "*" {
                    missing_replies += 1;
                    continue;
                }

                if let Ok(ip) = val.parse::<IpAddr>() {
                    if rtts.is_empty() {
                        return Err(ParseError::new(format!(
                            "error while parsing line '{line}': IP {ip} was \
                             found, but no RTTs were gathered"
                        )));
                    }

                    acc.add_host(this_hop_n, ip.to_string(), &rtts)?;

                    rtts = Vec::new();
                    missing_replies = 0;

                    continue;
                }

                if let Ok(rtt) = (if *part == "<1" {
                    Ok(0.0)
                } else {
                    extract_rtt_from_str(&val)
                }) {
                    rtts.push(rtt);
                }
            }

            if !rtts.is_empty() {
                let rtts_text = rtts
                    .iter()
                    .map(f64::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");

                return Err(ParseError::new(format!(
                    "some RTTs were found ({rtts_text}) but no IP address \
                     is associated with them"
                )));
            }

            if missing_replies > 0 {
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

    pub(crate) const WIN_TRACERT: &str = "\
Tracing route to dns.google [8.8.8.8]
over a maximum of 30 hops:

  1     4 ms     3 ms     3 ms  192.168.1.254
  2    10 ms     9 ms     9 ms  10.1.131.181
  3     *        *        *     Request timed out.
  4    12 ms    11 ms    12 ms  host.example.net [10.0.0.1]
  5    <1 ms    22 ms    21 ms  dns.google [8.8.8.8]

Trace complete.
";

    #[test]
    fn basic_tracert_output() {
        let hops = parse_and_validate(&WindowsTracertParser, WIN_TRACERT).unwrap();

        assert_eq!(hops.len(), 5);
        assert_eq!(hops[&1][0].host, "192.168.1.254");
        assert_eq!(hops[&1][0].avg_rtt, Some(3.333));
        assert!(hops[&3].is_empty());

        // The bracketed IP wins over the hostname column.
        assert_eq!(hops[&4][0].host, "10.0.0.1");

        // "<1 ms" counts as 0.
        assert_eq!(hops[&5][0].min_rtt, Some(0.0));
    }

    #[test]
    fn rtts_without_host_are_rejected() {
        let raw = "  1     4 ms     3 ms     3 ms\n";
        assert!(WindowsTracertParser.parse(raw).is_err());
    }
}
