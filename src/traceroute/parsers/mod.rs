//! Format-specific traceroute parsers and the registry that picks the best
//! one for a given input.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::errors::ParseError;

mod bsd;
mod iosxr;
mod junos;
mod line_by_line;
mod linux;
mod mtr;
mod mtr_json;
mod unknown1;
mod win_tracert;
mod winmtr;

pub use bsd::BsdParser;
pub use iosxr::IosXrParser;
pub use junos::JunosParser;
pub use linux::LinuxParser;
pub use mtr::MtrParser;
pub use mtr_json::MtrJsonParser;
pub use unknown1::UnknownFormat1Parser;
pub use win_tracert::WindowsTracertParser;
pub use winmtr::WinMtrParser;

/// Grouping label for parsers whose format origin is unknown.
pub const OTHER_UNKNOWN_TRACEROUTE_FORMAT: &str = "Other formats";

/// A host seen at a hop, as extracted from the raw text.
#[derive(Debug, Clone, PartialEq)]
pub struct HopHost {
    pub host: String,
    pub loss: Option<f64>,
    pub avg_rtt: Option<f64>,
    pub min_rtt: Option<f64>,
    pub max_rtt: Option<f64>,
}

impl HopHost {
    pub fn bare(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            loss: None,
            avg_rtt: None,
            min_rtt: None,
            max_rtt: None,
        }
    }
}

/// Hop number → hosts that replied at that hop. An empty vec means the hop
/// was seen but nothing replied.
pub type HopMap = BTreeMap<u32, Vec<HopHost>>;

/// A format-specific parser. Implementations fill a [`HopMap`] or fail
/// with a recoverable [`ParseError`]; the registry takes care of hop
/// contiguity validation and best-result selection.
pub trait Parser: Send + Sync {
    /// Short description of the format this parser understands.
    fn description(&self) -> &'static str;

    fn parse(&self, raw: &str) -> Result<HopMap, ParseError>;
}

/// Parse and validate: hop numbers must form a contiguous 1..N sequence
/// and at least one hop must be present.
pub fn parse_and_validate(parser: &dyn Parser, raw: &str) -> Result<HopMap, ParseError> {
    let hops = parser.parse(raw)?;

    if hops.is_empty() {
        return Err(ParseError::new("no hops found"));
    }

    let mut expected = 1;
    for hop_n in hops.keys() {
        if *hop_n != expected {
            return Err(ParseError::new(format!(
                "hop n. {expected} was expected, but {hop_n} was found"
            )));
        }

        expected += 1;
    }

    Ok(hops)
}

/// The ordered parser registry. Earlier entries win ties on host count.
pub fn registry() -> Vec<Box<dyn Parser>> {
    vec![
        Box::new(MtrJsonParser),
        Box::new(MtrParser),
        Box::new(JunosParser),
        Box::new(LinuxParser),
        Box::new(IosXrParser),
        Box::new(BsdParser),
        Box::new(WindowsTracertParser),
        Box::new(WinMtrParser),
        Box::new(UnknownFormat1Parser),
    ]
}

/// Outcome of the registry run: the winning parser's description and hops.
#[derive(Debug, Clone)]
pub struct ParsedTraceroute {
    pub parser: &'static str,
    pub hops: HopMap,
}

/// Try every registered parser on `raw` and return the result of the one
/// that extracted the most hosts. `None` when nothing could parse it.
pub fn parse_raw_traceroute(raw: &str) -> Option<ParsedTraceroute> {
    let mut best: Option<ParsedTraceroute> = None;

    for parser in registry() {
        let hops = match parse_and_validate(parser.as_ref(), raw) {
            Ok(hops) => hops,
            Err(e) => {
                debug!("parser {} rejected input: {e}", parser.description());
                continue;
            }
        };

        let count: usize = hops.values().map(Vec::len).sum();
        let best_count = best
            .as_ref()
            .map(|b| b.hops.values().map(Vec::len).sum::<usize>())
            .unwrap_or(0);

        // Strictly greater: on ties the earlier parser in the registry
        // keeps the win.
        if best.is_none() || count > best_count {
            best = Some(ParsedTraceroute {
                parser: parser.description(),
                hops,
            });
        }
    }

    best
}

static HOSTNAME_ALLOWED_LABELS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[_a-z0-9]([_a-z0-9-]{0,61}[_a-z0-9])?$").expect("hostname label regex")
});

/// Heuristic used by the text parsers to tell hostnames apart from noise
/// tokens. Strings shorter than 4 chars are assumed not to be hostnames;
/// the literal `ms`/`msec` unit tokens never are.
pub fn looks_like_a_hostname(hostname: &str) -> bool {
    let lower = hostname.to_ascii_lowercase();
    if lower == "ms" || lower == "msec" {
        return false;
    }

    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);

    if hostname.len() < 4 || hostname.len() > 253 {
        return false;
    }

    hostname
        .split('.')
        .all(|label| HOSTNAME_ALLOWED_LABELS.is_match(label))
}

/// Parse an RTT value, tolerating trailing `ms`/`msec` units.
pub fn extract_rtt_from_str(s: &str) -> Result<f64, ParseError> {
    let s = if let Some(stripped) = s.strip_suffix("msec") {
        stripped.trim()
    } else if let Some(stripped) = s.strip_suffix("ms") {
        stripped.trim()
    } else {
        s
    };

    s.parse::<f64>()
        .map_err(|_| ParseError::new(format!("not an RTT value: {s}")))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_heuristic() {
        assert!(looks_like_a_hostname("dns.google"));
        assert!(looks_like_a_hostname("62-101-124-17.fastres.net"));
        assert!(looks_like_a_hostname("core1.mil01.example.net."));
        assert!(looks_like_a_hostname("_dmarc.example.com"));

        assert!(!looks_like_a_hostname("ms"));
        assert!(!looks_like_a_hostname("msec"));
        assert!(!looks_like_a_hostname("ab"));
        assert!(!looks_like_a_hostname("a b.example.net"));
        assert!(!looks_like_a_hostname("-bad.example.net"));
    }

    #[test]
    fn rtt_extraction() {
        assert_eq!(extract_rtt_from_str("12.5").unwrap(), 12.5);
        assert_eq!(extract_rtt_from_str("12.5 ms").unwrap(), 12.5);
        assert_eq!(extract_rtt_from_str("3 msec").unwrap(), 3.0);
        assert!(extract_rtt_from_str("fast").is_err());
    }

    #[test]
    fn contiguity_is_enforced() {
        struct GapParser;

        impl Parser for GapParser {
            fn description(&self) -> &'static str {
                "gap"
            }

            fn parse(&self, _raw: &str) -> Result<HopMap, ParseError> {
                let mut hops = HopMap::new();
                hops.insert(1, vec![HopHost::bare("10.0.0.1")]);
                hops.insert(3, vec![HopHost::bare("10.0.0.3")]);
                Ok(hops)
            }
        }

        let err = parse_and_validate(&GapParser, "").unwrap_err();
        assert!(err.to_string().contains("hop n. 2 was expected"));
    }

    #[test]
    fn unparseable_input_returns_none() {
        assert!(parse_raw_traceroute("definitely not a traceroute").is_none());
        assert!(parse_raw_traceroute("").is_none());
    }

    #[test]
    fn best_parser_for_mtr_json_is_mtr_json() {
        let parsed = parse_raw_traceroute(samples::MTR_JSON_REPORT).unwrap();
        assert_eq!(parsed.parser, "MTR JSON");
        assert_eq!(parsed.hops.len(), 10);
        assert_eq!(
            parsed.hops.values().map(Vec::len).sum::<usize>(),
            10
        );
    }
}
