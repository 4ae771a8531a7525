//! Wire-level value types shared by the broker messages, the stores and the
//! enrichers.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// The IXP peering LAN a prefix belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IxpNetwork {
    pub lan_name: Option<String>,
    pub ix_name: Option<String>,
    pub ix_description: Option<String>,
}

/// Everything we know about a prefix: its origin ASNs (with holder names)
/// and/or the IXP LAN it is assigned to.
///
/// The JSON form is canonical: `origins` is a list of `[asn, holder]`
/// pairs or `null` (an empty list collapses to `null`), `ixp_network` is
/// an object or `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpDbInfo {
    #[serde(with = "cidr_serde")]
    pub prefix: IpNetwork,

    #[serde(deserialize_with = "deserialize_origins")]
    pub origins: Option<Vec<(u32, String)>>,

    pub ixp_network: Option<IxpNetwork>,
}

impl IpDbInfo {
    pub fn new(
        prefix: IpNetwork,
        origins: Option<Vec<(u32, String)>>,
        ixp_network: Option<IxpNetwork>,
    ) -> Self {
        Self {
            prefix,
            origins: normalize_origins(origins),
            ixp_network,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("IpDbInfo serialization cannot fail")
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

fn normalize_origins(origins: Option<Vec<(u32, String)>>) -> Option<Vec<(u32, String)>> {
    match origins {
        Some(v) if v.is_empty() => None,
        other => other,
    }
}

fn deserialize_origins<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<(u32, String)>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let origins: Option<Vec<(u32, String)>> = Option::deserialize(deserializer)?;
    Ok(normalize_origins(origins))
}

/// One host of an enrichment job: where it sits in the traceroute and the
/// raw string the parser extracted for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnricherJobHost {
    pub hop_n: u32,
    pub host_id: String,
    pub host: String,
}

/// A unit of enrichment work, published on the jobs queue and consumed by
/// exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnricherJob {
    pub traceroute_id: String,
    pub hosts: Vec<EnricherJobHost>,
}

impl EnricherJob {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("EnricherJob serialization cannot fail")
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// Serialize CIDRs as their canonical string form.
mod cidr_serde {
    use ipnetwork::IpNetwork;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(prefix: &IpNetwork, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&prefix.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<IpNetwork, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enricher_job_round_trip() {
        let raw = serde_json::json!({
            "traceroute_id": "test1",
            "hosts": [
                {"hop_n": 1, "host_id": "a", "host": "1.2.3.4"},
                {"hop_n": 2, "host_id": "b", "host": "www.example.com"},
            ]
        });

        let job: EnricherJob = serde_json::from_value(raw.clone()).unwrap();

        assert_eq!(job.hosts[0].host, "1.2.3.4");
        assert_eq!(job.hosts[1].host, "www.example.com");

        assert_eq!(serde_json::to_value(&job).unwrap(), raw);
    }

    #[test]
    fn ip_db_info_round_trip() {
        let raw = serde_json::json!({
            "prefix": "192.0.2.0/24",
            "origins": [[65500, "test 1"]],
            "ixp_network": {
                "lan_name": "test LAN name",
                "ix_name": "test name",
                "ix_description": "test description"
            }
        });

        let info: IpDbInfo = serde_json::from_value(raw.clone()).unwrap();

        assert_eq!(info.prefix, "192.0.2.0/24".parse::<IpNetwork>().unwrap());
        assert_eq!(info.origins, Some(vec![(65500, "test 1".to_string())]));
        let ixp = info.ixp_network.as_ref().unwrap();
        assert_eq!(ixp.lan_name.as_deref(), Some("test LAN name"));
        assert_eq!(ixp.ix_name.as_deref(), Some("test name"));
        assert_eq!(ixp.ix_description.as_deref(), Some("test description"));

        assert_eq!(serde_json::to_value(&info).unwrap(), raw);
    }

    #[test]
    fn empty_origins_collapse_to_none() {
        let raw = serde_json::json!({
            "prefix": "2001:db8::/32",
            "origins": [],
            "ixp_network": null
        });

        let info: IpDbInfo = serde_json::from_value(raw).unwrap();
        assert_eq!(info.origins, None);

        let reser = serde_json::to_value(&info).unwrap();
        assert_eq!(reser["origins"], serde_json::Value::Null);
    }

    #[test]
    fn new_normalizes_empty_origins() {
        let info = IpDbInfo::new(
            "10.0.0.0/8".parse().unwrap(),
            Some(vec![]),
            None,
        );
        assert_eq!(info.origins, None);
    }
}
