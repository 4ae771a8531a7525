//! IOS-XR `traceroute` output: BSD-style lines with MPLS label annotations
//! mixed in.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::ParseError;

use super::bsd::parse_bsd_like;
use super::{HopMap, Parser};

pub struct IosXrParser;

/// Ex.: [MPLS: Label 1111 Exp 0]
static MPLS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[MPLS:.+\]").expect("MPLS label regex"));

impl Parser for IosXrParser {
    fn description(&self) -> &'static str {
        "IOS-XR"
    }

    fn parse(&self, raw: &str) -> Result<HopMap, ParseError> {
        let cleaned = MPLS_LABEL.replace_all(raw, "");
        parse_bsd_like(&cleaned)
    }
}
