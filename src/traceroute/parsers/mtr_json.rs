//! `mtr --json` / `mtr --report --json` output.

use serde_json::Value;

use crate::errors::ParseError;

use super::{HopHost, HopMap, Parser};

pub struct MtrJsonParser;

impl Parser for MtrJsonParser {
    fn description(&self) -> &'static str {
        "MTR JSON"
    }

    fn parse(&self, raw: &str) -> Result<HopMap, ParseError> {
        let data: Value = serde_json::from_str(raw)
            .map_err(|_| ParseError::new("not a valid JSON"))?;

        // Two shapes exist in the wild: the report form
        // {"report": {"hubs": [{"count": …, "host": …, "Loss%": …,
        // "Avg": …, "Best": …, "Wrst": …}]}} and the flat form
        // {"hops": [{"hop": …, "ipaddr": …, "losspercent": …,
        // "avg": …, "best": …, "worst": …}]}.
        let (hops, keys) = if let Some(report) = data.get("report") {
            let hubs = report
                .get("hubs")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    ParseError::new("report.hubs was expected, but was not found")
                })?;

            (hubs, ["count", "host", "Loss%", "Avg", "Best", "Wrst"])
        } else if let Some(hops) = data.get("hops").and_then(Value::as_array) {
            (hops, ["hop", "ipaddr", "losspercent", "avg", "best", "worst"])
        } else {
            return Err(ParseError::new("couldn't find hops/hubs"));
        };

        let [hop_n_key, host_key, loss_key, avg_key, min_key, max_key] = keys;

        let mut out = HopMap::new();

        for hop in hops {
            let hop_n = json_u32(hop.get(hop_n_key)).ok_or_else(|| {
                ParseError::new(format!("missing or invalid '{hop_n_key}'"))
            })?;

            let entry = out.entry(hop_n).or_default();

            let host = hop
                .get(host_key)
                .and_then(Value::as_str)
                .ok_or_else(|| ParseError::new(format!("missing '{host_key}'")))?;

            if host == "???" {
                continue;
            }

            entry.push(HopHost {
                host: host.to_string(),
                loss: Some(json_f64_required(hop.get(loss_key), loss_key)?),
                avg_rtt: Some(json_f64_required(hop.get(avg_key), avg_key)?),
                min_rtt: Some(json_f64_required(hop.get(min_key), min_key)?),
                max_rtt: Some(json_f64_required(hop.get(max_key), max_key)?),
            });
        }

        Ok(out)
    }
}

fn json_u32(v: Option<&Value>) -> Option<u32> {
    match v? {
        Value::Number(n) => n.as_u64().map(|n| n as u32),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn json_f64(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn json_f64_required(v: Option<&Value>, key: &str) -> Result<f64, ParseError> {
    json_f64(v).ok_or_else(|| {
        ParseError::new(format!("missing or invalid '{key}' in the JSON"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traceroute::parsers::parse_and_validate;
    use crate::traceroute::parsers::samples::MTR_JSON_REPORT;

    const MTR_JSON_FLAT: &str = r#"{
        "destination": "8.8.8.8",
        "hops": [
            {"hop": 1, "ipaddr": "192.168.2.254", "host": "gw.lan", "losspercent": 0.0, "avg": 0.5, "best": 0.5, "worst": 0.5},
            {"hop": 2, "ipaddr": "10.0.0.1", "host": "", "losspercent": 0.0, "avg": 2.7, "best": 1.9, "worst": 3.7},
            {"hop": 3, "ipaddr": "8.8.8.8", "host": "dns.google", "losspercent": 0.0, "avg": 5.6, "best": 4.4, "worst": 6.5}
        ]
    }"#;

    #[test]
    fn report_form() {
        let hops = parse_and_validate(&MtrJsonParser, MTR_JSON_REPORT).unwrap();

        assert_eq!(hops.len(), 10);
        assert_eq!(
            hops[&6][0],
            HopHost {
                host: "62-101-124-17.fastres.net".to_string(),
                loss: Some(0.0),
                avg_rtt: Some(59.78),
                min_rtt: Some(20.25),
                max_rtt: Some(101.01),
            }
        );
        assert_eq!(hops[&10][0].host, "dns.google");
    }

    #[test]
    fn flat_form() {
        let hops = parse_and_validate(&MtrJsonParser, MTR_JSON_FLAT).unwrap();

        assert_eq!(hops.len(), 3);
        assert_eq!(hops[&1][0].host, "192.168.2.254");
        assert_eq!(hops[&3][0].avg_rtt, Some(5.6));
    }

    #[test]
    fn no_reply_hop_is_kept_empty() {
        let raw = r#"{
            "report": {
                "hubs": [
                    {"count": 1, "host": "192.168.1.254", "Loss%": 0.0, "Avg": 1.0, "Best": 1.0, "Wrst": 1.0},
                    {"count": 2, "host": "???", "Loss%": 100.0, "Avg": 0.0, "Best": 0.0, "Wrst": 0.0},
                    {"count": 3, "host": "10.0.0.1", "Loss%": 0.0, "Avg": 2.0, "Best": 2.0, "Wrst": 2.0}
                ]
            }
        }"#;

        let hops = parse_and_validate(&MtrJsonParser, raw).unwrap();
        assert_eq!(hops.len(), 3);
        assert!(hops[&2].is_empty());
    }

    #[test]
    fn not_json_is_rejected() {
        assert!(MtrJsonParser.parse("traceroute to 8.8.8.8").is_err());
        assert!(MtrJsonParser.parse("{\"foo\": 1}").is_err());
    }
}
