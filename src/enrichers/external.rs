//! Origin-AS lookups against the RIPEstat prefix-overview endpoint.

use std::net::IpAddr;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, warn};

use crate::metrics::{Timed, ERRORS, LOOKUPS};
use crate::structures::IpDbInfo;

const RIPESTAT_PREFIX_OVERVIEW: &str =
    "https://stat.ripe.net/data/prefix-overview/data.json";

/// Where IP info comes from when the local cache misses. Pluggable so
/// tests can count and stub the lookups.
#[async_trait]
pub trait ExternalSources: Send + Sync {
    /// Best-effort: any failure is logged and turned into `None`, and the
    /// host is enriched without origin data.
    async fn ip_info(&self, ip: IpAddr) -> Option<IpDbInfo>;
}

#[derive(Debug, Deserialize)]
struct RipeStatResponse {
    status: String,
    data: RipeStatData,
}

#[derive(Debug, Deserialize)]
struct RipeStatData {
    resource: String,
    #[serde(default)]
    asns: Vec<RipeStatAsn>,
}

#[derive(Debug, Deserialize)]
struct RipeStatAsn {
    asn: u32,
    holder: String,
}

pub struct RipeStatClient {
    client: reqwest::Client,
}

impl RipeStatClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for RipeStatClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExternalSources for RipeStatClient {
    async fn ip_info(&self, ip: IpAddr) -> Option<IpDbInfo> {
        LOOKUPS.with_label_values(&["external_sources"]).inc();
        let _timing = Timed::with_descr("ripestat.query_time", ip.to_string());

        let response = match self
            .client
            .get(RIPESTAT_PREFIX_OVERVIEW)
            .query(&[("resource", ip.to_string())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => response,
            Err(e) => {
                warn!("RIPEstat query for {ip} failed: {e}");
                ERRORS.with_label_values(&["ripestat_http"]).inc();
                return None;
            }
        };

        let body: RipeStatResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("RIPEstat query for {ip} failed: {e}");
                ERRORS.with_label_values(&["ripestat_http"]).inc();
                return None;
            }
        };

        if body.status != "ok" {
            error!(
                "RIPEstat query for {ip} returned an error: status is {}",
                body.status
            );
            ERRORS.with_label_values(&["ripestat_query"]).inc();
            return None;
        }

        let prefix = match body.data.resource.parse() {
            Ok(prefix) => prefix,
            Err(_) => {
                error!(
                    "RIPEstat query for {ip} returned an unusable resource: {}",
                    body.data.resource
                );
                ERRORS.with_label_values(&["ripestat_query"]).inc();
                return None;
            }
        };

        let origins = body
            .data
            .asns
            .into_iter()
            .map(|o| (o.asn, o.holder))
            .collect::<Vec<_>>();

        Some(IpDbInfo::new(
            prefix,
            if origins.is_empty() {
                None
            } else {
                Some(origins)
            },
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ripestat_payload_parses() {
        let raw = r#"{
            "status": "ok",
            "data": {
                "resource": "62.101.112.0/20",
                "asns": [{"asn": 12874, "holder": "FASTWEB - Fastweb SpA"}]
            }
        }"#;

        let parsed: RipeStatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, "ok");
        assert_eq!(parsed.data.resource, "62.101.112.0/20");
        assert_eq!(parsed.data.asns[0].asn, 12874);
    }

    #[test]
    fn missing_asns_default_to_empty() {
        let raw = r#"{"status": "ok", "data": {"resource": "192.0.2.0/24"}}"#;

        let parsed: RipeStatResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.data.asns.is_empty());
    }
}
