//! Traceroute records: parsing of submitted raw text, persistence of the
//! hop/host tree, the JSON projection used by the notification events and
//! the tabular text rendering.

pub mod parsers;
mod render;
mod store;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::config::MAX_ENRICHMENT_TIME;
use crate::net::ip_is_global;
use crate::structures::{EnricherJob, EnricherJobHost, IxpNetwork};

pub use render::to_text;
pub use store::TracerouteStore;

/// Maximum accepted size of a raw submission.
pub const MAX_RAW_LEN: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct Traceroute {
    pub id: String,
    pub raw: String,
    pub created: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub parsed: bool,
    pub enriched: bool,
    pub enrichment_started: Option<DateTime<Utc>>,
    pub enrichment_completed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotParsed,
    Wip,
    Timeout,
    Enriched,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::NotParsed => "not_parsed",
            Status::Wip => "wip",
            Status::Timeout => "timeout",
            Status::Enriched => "enriched",
        }
    }
}

impl Traceroute {
    pub fn status_at(&self, now: DateTime<Utc>) -> Status {
        if !self.parsed {
            return Status::NotParsed;
        }

        if self.enriched {
            return Status::Enriched;
        }

        if now - self.created > chrono::Duration::from_std(MAX_ENRICHMENT_TIME).unwrap() {
            return Status::Timeout;
        }

        Status::Wip
    }

    pub fn status(&self) -> Status {
        self.status_at(Utc::now())
    }

    /// JSON projection served to clients and embedded in the completion
    /// event: id, status, lifecycle flags and the full hop/host tree.
    pub fn to_dict(&self, hops: &[Hop]) -> serde_json::Value {
        let mut hops_map = serde_json::Map::new();

        for hop in hops {
            hops_map.insert(
                hop.hop_number.to_string(),
                serde_json::Value::Array(hop.hosts.iter().map(Host::to_dict).collect()),
            );
        }

        json!({
            "id": self.id,
            "status": self.status().as_str(),
            "enriched": self.enriched,
            "parsed": self.parsed,
            "hops": hops_map,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Hop {
    pub id: i64,
    pub hop_number: u32,
    pub hosts: Vec<Host>,
}

#[derive(Debug, Clone)]
pub struct Host {
    pub id: String,
    pub hop_number: u32,
    pub original_host: String,
    pub avg_rtt: Option<f64>,
    pub min_rtt: Option<f64>,
    pub max_rtt: Option<f64>,
    pub loss: Option<f64>,
    pub ip: Option<String>,
    pub name: Option<String>,
    pub enriched: bool,
    pub origins: Vec<HostOrigin>,
    pub ixp_network: Option<IxpNetwork>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOrigin {
    pub asn: u32,
    pub holder: String,
}

impl Host {
    pub fn is_global(&self) -> bool {
        self.ip
            .as_deref()
            .and_then(|ip| ip.parse().ok())
            .map(ip_is_global)
            .unwrap_or(false)
    }

    /// The host as rendered in the per-host notification events.
    pub fn to_dict(&self) -> serde_json::Value {
        let origins = if self.origins.is_empty() {
            serde_json::Value::Null
        } else {
            json!(self
                .origins
                .iter()
                .map(|o| json!([o.asn, o.holder]))
                .collect::<Vec<_>>())
        };

        json!({
            "id": self.id,
            "hop_number": self.hop_number,
            "original_host": self.original_host,
            "avg_rtt": self.avg_rtt,
            "min_rtt": self.min_rtt,
            "max_rtt": self.max_rtt,
            "loss": self.loss,
            "ip": self.ip,
            "is_global": self.is_global(),
            "name": self.name,
            "enriched": self.enriched,
            "ixp_network": self.ixp_network.as_ref().map(|ixp| json!({
                "lan_name": ixp.lan_name,
                "ix_name": ixp.ix_name,
                "ix_description": ixp.ix_description,
            })),
            "origins": origins,
        })
    }
}

/// Submit a raw traceroute: store it, parse it with the registry, persist
/// the hop/host tree and hand the enrichment job to the dispatcher. When
/// nothing can parse the text the row stays with `parsed = false` and no
/// job goes out.
pub async fn create_traceroute(
    store: &TracerouteStore,
    jobs: &crate::enrichers::dispatcher::EnrichmentJobsDispatcher,
    raw: &str,
) -> Result<Traceroute, crate::errors::DbError> {
    let raw = truncate_raw(raw);

    let traceroute = store.create(raw).await?;

    if let Some(parsed) = parsers::parse_raw_traceroute(raw) {
        store.store_parse_result(&traceroute.id, &parsed.hops).await?;

        let hops = store.load_hops(&traceroute.id).await?;
        jobs.dispatch(&enrichment_job(&traceroute.id, &hops));
    }

    store.get(&traceroute.id).await
}

/// Submissions are capped at 16 KiB; longer pastes are cut at the nearest
/// char boundary.
fn truncate_raw(raw: &str) -> &str {
    if raw.len() <= MAX_RAW_LEN {
        return raw;
    }

    let mut end = MAX_RAW_LEN;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }

    &raw[..end]
}

/// Build the enrichment job for a parsed traceroute: every host of every
/// hop, in hop order.
pub fn enrichment_job(traceroute_id: &str, hops: &[Hop]) -> EnricherJob {
    let mut hosts = Vec::new();

    for hop in hops {
        for host in &hop.hosts {
            hosts.push(EnricherJobHost {
                hop_n: hop.hop_number,
                host_id: host.id.clone(),
                host: host.original_host.clone(),
            });
        }
    }

    EnricherJob {
        traceroute_id: traceroute_id.to_string(),
        hosts,
    }
}
