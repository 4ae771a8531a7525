//! Shared machinery for parsers that walk the input line by line and
//! accumulate per-hop host/RTT observations before producing the final
//! hop map.

use crate::errors::ParseError;

use super::{HopHost, HopMap};

/// Accumulates observations per hop. A hop is either `None` (seen, but no
/// replies at all) or an ordered list of hosts with their RTT samples.
/// Host order within a hop is insertion order, mirroring the raw text.
#[derive(Debug, Default)]
pub struct LineAccumulator {
    hops: Vec<(u32, Option<Vec<(String, Vec<f64>)>>)>,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `hop_n` received no replies.
    pub fn add_missing(&mut self, hop_n: u32) -> Result<(), ParseError> {
        match self.entry(hop_n) {
            Some(Some(_)) => Err(ParseError::new(format!(
                "hop n. {hop_n} reported without replies, but hosts were \
                 already recorded for it"
            ))),
            Some(None) => Ok(()),
            None => {
                self.hops.push((hop_n, None));
                Ok(())
            }
        }
    }

    /// Append RTT samples for `host` at `hop_n`. Can be called repeatedly
    /// for the same host; samples accumulate.
    pub fn add_host(
        &mut self,
        hop_n: u32,
        host: impl Into<String>,
        rtts: &[f64],
    ) -> Result<(), ParseError> {
        let host = host.into();

        if self.entry(hop_n).is_none() {
            self.hops.push((hop_n, Some(Vec::new())));
        }

        match self.entry(hop_n) {
            Some(Some(hosts)) => {
                if let Some((_, samples)) =
                    hosts.iter_mut().find(|(h, _)| *h == host)
                {
                    samples.extend_from_slice(rtts);
                } else {
                    hosts.push((host, rtts.to_vec()));
                }

                Ok(())
            }
            _ => Err(ParseError::new(format!(
                "host {host} found at hop n. {hop_n}, but the hop was \
                 already recorded as having no replies"
            ))),
        }
    }

    fn entry(&mut self, hop_n: u32) -> Option<&mut Option<Vec<(String, Vec<f64>)>>> {
        self.hops
            .iter_mut()
            .find(|(n, _)| *n == hop_n)
            .map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Validate hop contiguity and fold the accumulated samples into the
    /// final hop map (avg/min/max per host, loss unknown for these
    /// formats).
    pub fn finish(self) -> Result<HopMap, ParseError> {
        if self.hops.is_empty() {
            return Err(ParseError::new("no hops found"));
        }

        let mut out = HopMap::new();
        let mut last_hop_n = 0u32;

        for (hop_n, hosts) in self.hops {
            if hop_n != last_hop_n + 1 {
                return Err(ParseError::new(format!(
                    "hop n. {hop_n} found, but the previous one was {last_hop_n}"
                )));
            }

            let entry = out.entry(hop_n).or_default();

            if let Some(hosts) = hosts {
                for (host, rtts) in hosts {
                    if rtts.is_empty() {
                        return Err(ParseError::new(format!(
                            "host {host} at hop n. {hop_n} has no RTTs"
                        )));
                    }

                    let sum: f64 = rtts.iter().sum();
                    let avg = round3(sum / rtts.len() as f64);
                    let min = rtts.iter().cloned().fold(f64::INFINITY, f64::min);
                    let max = rtts.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

                    entry.push(HopHost {
                        host,
                        loss: None,
                        avg_rtt: Some(avg),
                        min_rtt: Some(min),
                        max_rtt: Some(max),
                    });
                }
            }

            last_hop_n = hop_n;
        }

        Ok(out)
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Strip the noise characters the line parsers tolerate around tokens.
pub fn clean_token(token: &str) -> String {
    token
        .replace(['(', ')'], "")
        .replace("^C", "")
        .trim()
        .to_string()
}
