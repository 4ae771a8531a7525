//! Catch-all for a format seen in submissions whose origin tool is
//! unknown: `N: host RTTms` lines.

use std::net::IpAddr;

use crate::errors::ParseError;

use super::line_by_line::LineAccumulator;
use super::{looks_like_a_hostname, HopMap, Parser, OTHER_UNKNOWN_TRACEROUTE_FORMAT};

pub struct UnknownFormat1Parser;

impl Parser for UnknownFormat1Parser {
    fn description(&self) -> &'static str {
        OTHER_UNKNOWN_TRACEROUTE_FORMAT
    }

    fn parse(&self, raw: &str) -> Result<HopMap, ParseError> {
        let mut acc = LineAccumulator::new();

        let mut processing_hops = false;
        let mut last_hop_n: u32 = 0;

        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            let Some(&hop_n_raw) = parts.first() else {
                continue;
            };

            // 1:  gw.lan  1.5ms
            if hop_n_raw == "1:" {
                processing_hops = true;
            }

            if !processing_hops {
                continue;
            }

            let Some(raw_n) = hop_n_raw.strip_suffix(':') else {
                return Err(ParseError::new(format!(
                    "hop n. does not end with ':': {hop_n_raw}"
                )));
            };

            let this_hop_n: u32 = raw_n.parse().map_err(|_| {
                ParseError::new(format!("the parsed hop is not numeric: {raw_n}"))
            })?;

            if this_hop_n != last_hop_n && this_hop_n != last_hop_n + 1 {
                return Err(ParseError::new(format!(
                    "unexpected hop n.: found {this_hop_n}, previous was {last_hop_n}"
                )));
            }

            let host = parts.get(1).ok_or_else(|| {
                ParseError::new(format!("no host found in line {line}"))
            })?;

            if host.parse::<IpAddr>().is_err() && !looks_like_a_hostname(host) {
                return Err(ParseError::new(format!(
                    "can't determine the host from line {line}"
                )));
            }

            let rtt_raw = parts.get(2).ok_or_else(|| {
                ParseError::new(format!("no RTT found in line {line}"))
            })?;

            let Some(rtt_raw) = rtt_raw.strip_suffix("ms") else {
                return Err(ParseError::new(format!(
                    "RTT does not end with 'ms': {rtt_raw}"
                )));
            };

            let rtt: f64 = rtt_raw.parse().map_err(|_| {
                ParseError::new(format!("can't convert string '{rtt_raw}' into float"))
            })?;

            acc.add_host(this_hop_n, host.to_string(), &[rtt])?;

            last_hop_n = this_hop_n;
        }

        if acc.is_empty() {
            return Err(ParseError::new("no hops found"));
        }

        acc.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traceroute::parsers::parse_and_validate;

    pub(crate) const UNKNOWN1: &str = "\
traceroute to 8.8.8.8
 1:  gateway.lan  1.503ms
 2:  10.1.131.181  9.720ms
 2:  10.1.131.181  9.880ms
 3:  8.8.8.8  21.817ms
";

    #[test]
    fn colon_numbered_lines() {
        let hops = parse_and_validate(&UnknownFormat1Parser, UNKNOWN1).unwrap();

        assert_eq!(hops.len(), 3);
        assert_eq!(hops[&1][0].host, "gateway.lan");

        // Hop 2 appears twice: samples accumulate on the same host.
        assert_eq!(hops[&2].len(), 1);
        assert_eq!(hops[&2][0].min_rtt, Some(9.72));
        assert_eq!(hops[&2][0].max_rtt, Some(9.88));
        assert_eq!(hops[&2][0].avg_rtt, Some(9.8));
    }
}
