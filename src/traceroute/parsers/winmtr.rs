//! WinMTR statistics table export.

use std::net::IpAddr;

use crate::errors::ParseError;

use super::{looks_like_a_hostname, HopHost, HopMap, Parser};

pub struct WinMtrParser;

impl Parser for WinMtrParser {
    fn description(&self) -> &'static str {
        "WinMTR"
    }

    fn parse(&self, raw: &str) -> Result<HopMap, ParseError> {
        let mut out = HopMap::new();

        // Hops are not numbered in the table: each data row is the next
        // hop.
        let mut add_hop = |host: Option<HopHost>| {
            let hop_n = out.len() as u32 + 1;
            let entry = out.entry(hop_n).or_default();
            if let Some(host) = host {
                entry.push(host);
            }
        };

        let mut title_found = false;
        let mut processing_hops = false;

        for line in raw.lines() {
            let line = line.trim();

            if line.is_empty() {
                continue;
            }

            if line.contains("WinMTR statistics") {
                title_found = true;
                continue;
            }

            if !title_found {
                continue;
            }

            if line.contains("----") {
                processing_hops = true;
                continue;
            }

            if !processing_hops {
                continue;
            }

            if line.contains("____") {
                continue;
            }

            // |  192.168.1.254 -    0 |  471 |  471 |    0 |    0 |   16 |    0 |
            let line = line
                .replace('|', "")
                .replace('-', "")
                .replace("No response from host", "?");

            let parts: Vec<&str> = line.split_whitespace().collect();

            if parts.len() < 8 {
                return Err(ParseError::new(format!(
                    "was expecting to find 8 parts: {line}"
                )));
            }

            let host = parts[0];

            if host == "?" {
                add_hop(None);
                continue;
            }

            if host.parse::<IpAddr>().is_err() && !looks_like_a_hostname(host) {
                return Err(ParseError::new(format!(
                    "can't determine the host from line {line}"
                )));
            }

            // Columns: Host %loss Sent Recv Best Avrg Wrst Last
            let mut values = [0.0f64; 4];
            for (slot, (attr, idx)) in values.iter_mut().zip([
                ("loss", 1),
                ("min_rtt", 4),
                ("avg_rtt", 5),
                ("max_rtt", 6),
            ]) {
                *slot = parts[idx].parse().map_err(|_| {
                    ParseError::new(format!("can't convert {attr} from {}", parts[idx]))
                })?;
            }

            add_hop(Some(HopHost {
                host: host.to_string(),
                loss: Some(values[0]),
                min_rtt: Some(values[1]),
                avg_rtt: Some(values[2]),
                max_rtt: Some(values[3]),
            }));
        }

        Ok(out)
    }
}
