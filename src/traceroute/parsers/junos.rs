//! Junos `traceroute monitor` output: the mtr statistics table with plain
//! `N.`-prefixed hop numbers instead of the `N.|--` marker.

use crate::errors::ParseError;

use super::mtr::parse_mtr_like;
use super::{HopMap, Parser};

pub struct JunosParser;

impl Parser for JunosParser {
    fn description(&self) -> &'static str {
        "Junos"
    }

    fn parse(&self, raw: &str) -> Result<HopMap, ParseError> {
        parse_mtr_like(raw, junos_hop_n)
    }
}

///  1. 62.3.32.1         0.0%    10    1.2   1.3   1.2   1.5   0.1
fn junos_hop_n(line: &str) -> Result<(u32, String), ParseError> {
    let mut parts = line.split_whitespace();

    let first_part = parts
        .next()
        .ok_or_else(|| ParseError::new("empty hop line"))?;

    if !first_part.ends_with('.') {
        return Err(ParseError::new(format!(
            "a dot was expected at the end of the first part ({first_part})"
        )));
    }

    let raw_hop_n = first_part.replace('.', "");

    let hop_n = raw_hop_n
        .parse()
        .map_err(|_| ParseError::new(format!("the parsed hop is not numeric: {raw_hop_n}")))?;

    Ok((hop_n, parts.collect::<Vec<_>>().join(" ")))
}
