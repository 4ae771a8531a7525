//! MTR plain-text output, both the `--report` form (`N.|-- host …`) and
//! the interactive display copy-pasted as text.

use crate::errors::ParseError;

use super::{HopHost, HopMap, Parser};

pub struct MtrParser;

impl Parser for MtrParser {
    fn description(&self) -> &'static str {
        "MTR plain text"
    }

    fn parse(&self, raw: &str) -> Result<HopMap, ParseError> {
        parse_mtr_like(raw, report_hop_n)
    }
}

///  1.|-- 192.168.1.254              0.0%     2    3.8   6.4   3.8   9.1   3.7
fn report_hop_n(line: &str) -> Result<(u32, String), ParseError> {
    let (before, after) = line
        .split_once("|--")
        .ok_or_else(|| ParseError::new("'|--' marker not found"))?;

    let raw_hop_n = before.trim();
    let raw_hop_n = raw_hop_n
        .strip_suffix('.')
        .ok_or_else(|| ParseError::new("a dot was expected after the hop n."))?;

    let hop_n = raw_hop_n
        .parse()
        .map_err(|_| ParseError::new(format!("the parsed hop is not numeric: {raw_hop_n}")))?;

    Ok((hop_n, after.trim().to_string()))
}

/// Shared by the MTR report/interactive formats and the Junos traceroute
/// monitor, which differ only in how hop numbers are written.
pub(super) fn parse_mtr_like(
    raw: &str,
    get_hop_n: fn(&str) -> Result<(u32, String), ParseError>,
) -> Result<HopMap, ParseError> {
    let mut out = HopMap::new();
    let mut processing_hops = false;

    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }

        // Header of the stats table:
        // HOST: localhost    Loss%   Snt   Last   Avg  Best  Wrst StDev
        // (interactive runs indent it and spell it "Host")
        let trimmed = line.trim_start();
        if trimmed.starts_with("HOST:") || trimmed.starts_with("Host") {
            processing_hops = true;
            continue;
        }

        if !processing_hops {
            continue;
        }

        let (hop_n, line_info) = get_hop_n(line)?;

        let fields: Vec<&str> = line_info.split_whitespace().collect();
        if fields.is_empty() {
            return Err(ParseError::new(format!("empty hop line: {line}")));
        }

        let entry = out.entry(hop_n).or_default();

        // "192.168.1.254" or "???" when no replies came back.
        let host = fields[0];
        if host.contains('?') {
            continue;
        }

        // Columns: host Loss% Snt Last Avg Best Wrst StDev
        if fields.len() < 7 {
            return Err(ParseError::new(format!(
                "was expecting at least 7 fields: {line}"
            )));
        }

        let raw_loss = fields[1].replace('%', "");
        let loss: f64 = raw_loss.parse().map_err(|_| {
            ParseError::new(format!(
                "can't parse the loss value {raw_loss}, it doesn't look like a float"
            ))
        })?;

        let mut rtts = [0.0f64; 3];
        for (slot, (what, idx)) in rtts
            .iter_mut()
            .zip([("avg_rtt", 4), ("min_rtt", 5), ("max_rtt", 6)])
        {
            let raw_rtt = fields[idx];
            *slot = raw_rtt.parse().map_err(|_| {
                ParseError::new(format!(
                    "can't parse the {what} RTT value {raw_rtt}, \
                     it doesn't look like a float"
                ))
            })?;
        }

        entry.push(HopHost {
            host: host.to_string(),
            loss: Some(loss),
            avg_rtt: Some(rtts[0]),
            min_rtt: Some(rtts[1]),
            max_rtt: Some(rtts[2]),
        });
    }

    Ok(out)
}
