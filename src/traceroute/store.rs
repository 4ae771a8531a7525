//! SQL persistence for the traceroute/hop/host tree.

use std::collections::HashMap;
use std::time::Duration;

use sqlx::Row;

use crate::db::{now_ts, record_uid, ts_to_datetime, Db};
use crate::errors::DbError;
use crate::structures::IxpNetwork;

use super::parsers::HopMap;
use super::{Hop, Host, HostOrigin, Traceroute};

#[derive(Clone)]
pub struct TracerouteStore {
    db: Db,
}

impl TracerouteStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create(&self, raw: &str) -> Result<Traceroute, DbError> {
        let id = record_uid();
        let now = now_ts();

        sqlx::query(
            "INSERT INTO traceroute (id, raw, created, last_seen, parsed, enriched)
             VALUES (?, ?, ?, ?, 0, 0)",
        )
        .bind(&id)
        .bind(raw)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        self.get(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<Traceroute, DbError> {
        let row = sqlx::query(
            "SELECT id, raw, created, last_seen, parsed, enriched,
                    enrichment_started, enrichment_completed
             FROM traceroute WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| DbError::NotFound(format!("traceroute {id}")))?;

        Ok(Traceroute {
            id: row.try_get("id")?,
            raw: row.try_get("raw")?,
            created: ts_to_datetime(row.try_get("created")?),
            last_seen: ts_to_datetime(row.try_get("last_seen")?),
            parsed: row.try_get::<i64, _>("parsed")? != 0,
            enriched: row.try_get::<i64, _>("enriched")? != 0,
            enrichment_started: row
                .try_get::<Option<i64>, _>("enrichment_started")?
                .map(ts_to_datetime),
            enrichment_completed: row
                .try_get::<Option<i64>, _>("enrichment_completed")?
                .map(ts_to_datetime),
        })
    }

    pub async fn touch_last_seen(&self, id: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE traceroute SET last_seen = ? WHERE id = ?")
            .bind(now_ts())
            .bind(id)
            .execute(self.db.pool())
            .await?;

        Ok(())
    }

    /// Persist a successful parse: the hop/host tree plus the `parsed`
    /// flag.
    pub async fn store_parse_result(
        &self,
        traceroute_id: &str,
        hops: &HopMap,
    ) -> Result<(), DbError> {
        for (hop_n, hosts) in hops {
            sqlx::query("INSERT INTO hop (traceroute_id, hop_number) VALUES (?, ?)")
                .bind(traceroute_id)
                .bind(*hop_n as i64)
                .execute(self.db.pool())
                .await?;

            let hop_id: i64 = sqlx::query_scalar(
                "SELECT id FROM hop WHERE traceroute_id = ? AND hop_number = ?",
            )
            .bind(traceroute_id)
            .bind(*hop_n as i64)
            .fetch_one(self.db.pool())
            .await?;

            for host in hosts {
                sqlx::query(
                    "INSERT INTO host
                     (id, hop_id, original_host, avg_rtt, min_rtt, max_rtt, loss, enriched)
                     VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
                )
                .bind(record_uid())
                .bind(hop_id)
                .bind(&host.host)
                .bind(host.avg_rtt)
                .bind(host.min_rtt)
                .bind(host.max_rtt)
                .bind(host.loss)
                .execute(self.db.pool())
                .await?;
            }
        }

        sqlx::query("UPDATE traceroute SET parsed = 1 WHERE id = ?")
            .bind(traceroute_id)
            .execute(self.db.pool())
            .await?;

        Ok(())
    }

    /// Load the full hop/host tree, origins and IXP children included.
    pub async fn load_hops(&self, traceroute_id: &str) -> Result<Vec<Hop>, DbError> {
        let hop_rows = sqlx::query(
            "SELECT id, hop_number FROM hop WHERE traceroute_id = ? ORDER BY hop_number",
        )
        .bind(traceroute_id)
        .fetch_all(self.db.pool())
        .await?;

        let mut hops: Vec<Hop> = hop_rows
            .iter()
            .map(|row| {
                Ok(Hop {
                    id: row.try_get("id")?,
                    hop_number: row.try_get::<i64, _>("hop_number")? as u32,
                    hosts: Vec::new(),
                })
            })
            .collect::<Result<_, sqlx::Error>>()?;

        let host_rows = sqlx::query(
            "SELECT h.id, h.hop_id, h.original_host, h.avg_rtt, h.min_rtt, h.max_rtt,
                    h.loss, h.ip, h.name, h.enriched, p.hop_number
             FROM host h JOIN hop p ON h.hop_id = p.id
             WHERE p.traceroute_id = ?
             ORDER BY p.hop_number, h.id",
        )
        .bind(traceroute_id)
        .fetch_all(self.db.pool())
        .await?;

        let origin_rows = sqlx::query(
            "SELECT o.host_id, o.asn, o.holder
             FROM host_origin o
             JOIN host h ON o.host_id = h.id
             JOIN hop p ON h.hop_id = p.id
             WHERE p.traceroute_id = ?
             ORDER BY o.id",
        )
        .bind(traceroute_id)
        .fetch_all(self.db.pool())
        .await?;

        let mut origins: HashMap<String, Vec<HostOrigin>> = HashMap::new();
        for row in origin_rows {
            origins
                .entry(row.try_get("host_id")?)
                .or_default()
                .push(HostOrigin {
                    asn: row.try_get::<i64, _>("asn")? as u32,
                    holder: row.try_get("holder")?,
                });
        }

        let ixp_rows = sqlx::query(
            "SELECT x.host_id, x.lan_name, x.ix_name, x.ix_description
             FROM host_ixp_network x
             JOIN host h ON x.host_id = h.id
             JOIN hop p ON h.hop_id = p.id
             WHERE p.traceroute_id = ?",
        )
        .bind(traceroute_id)
        .fetch_all(self.db.pool())
        .await?;

        let mut ixps: HashMap<String, IxpNetwork> = HashMap::new();
        for row in ixp_rows {
            ixps.insert(
                row.try_get("host_id")?,
                IxpNetwork {
                    lan_name: row.try_get("lan_name")?,
                    ix_name: row.try_get("ix_name")?,
                    ix_description: row.try_get("ix_description")?,
                },
            );
        }

        for row in host_rows {
            let hop_id: i64 = row.try_get("hop_id")?;
            let id: String = row.try_get("id")?;

            let host = Host {
                origins: origins.remove(&id).unwrap_or_default(),
                ixp_network: ixps.remove(&id),
                id,
                hop_number: row.try_get::<i64, _>("hop_number")? as u32,
                original_host: row.try_get("original_host")?,
                avg_rtt: row.try_get("avg_rtt")?,
                min_rtt: row.try_get("min_rtt")?,
                max_rtt: row.try_get("max_rtt")?,
                loss: row.try_get("loss")?,
                ip: row.try_get("ip")?,
                name: row.try_get("name")?,
                enriched: row.try_get::<i64, _>("enriched")? != 0,
            };

            if let Some(hop) = hops.iter_mut().find(|h| h.id == hop_id) {
                hop.hosts.push(host);
            }
        }

        Ok(hops)
    }

    pub async fn get_host(&self, host_id: &str) -> Result<Host, DbError> {
        let row = sqlx::query(
            "SELECT h.id, h.original_host, h.avg_rtt, h.min_rtt, h.max_rtt, h.loss,
                    h.ip, h.name, h.enriched, p.hop_number
             FROM host h JOIN hop p ON h.hop_id = p.id
             WHERE h.id = ?",
        )
        .bind(host_id)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| DbError::NotFound(format!("host {host_id}")))?;

        let origin_rows = sqlx::query(
            "SELECT asn, holder FROM host_origin WHERE host_id = ? ORDER BY id",
        )
        .bind(host_id)
        .fetch_all(self.db.pool())
        .await?;

        let origins = origin_rows
            .iter()
            .map(|row| {
                Ok(HostOrigin {
                    asn: row.try_get::<i64, _>("asn")? as u32,
                    holder: row.try_get("holder")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()?;

        let ixp_network = sqlx::query(
            "SELECT lan_name, ix_name, ix_description FROM host_ixp_network
             WHERE host_id = ?",
        )
        .bind(host_id)
        .fetch_optional(self.db.pool())
        .await?
        .map(|row| -> Result<IxpNetwork, sqlx::Error> {
            Ok(IxpNetwork {
                lan_name: row.try_get("lan_name")?,
                ix_name: row.try_get("ix_name")?,
                ix_description: row.try_get("ix_description")?,
            })
        })
        .transpose()?;

        Ok(Host {
            id: row.try_get("id")?,
            hop_number: row.try_get::<i64, _>("hop_number")? as u32,
            original_host: row.try_get("original_host")?,
            avg_rtt: row.try_get("avg_rtt")?,
            min_rtt: row.try_get("min_rtt")?,
            max_rtt: row.try_get("max_rtt")?,
            loss: row.try_get("loss")?,
            ip: row.try_get("ip")?,
            name: row.try_get("name")?,
            enriched: row.try_get::<i64, _>("enriched")? != 0,
            origins,
            ixp_network,
        })
    }

    pub async fn mark_enrichment_started(&self, id: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE traceroute SET enrichment_started = ? WHERE id = ?")
            .bind(now_ts())
            .bind(id)
            .execute(self.db.pool())
            .await?;

        Ok(())
    }

    pub async fn mark_enrichment_completed(&self, id: &str) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE traceroute SET enriched = 1, enrichment_completed = ? WHERE id = ?",
        )
        .bind(now_ts())
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Store what enrichment found out about a host.
    pub async fn save_host_enrichment(
        &self,
        host_id: &str,
        ip: Option<&str>,
        name: Option<&str>,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE host SET ip = ?, name = ?, enriched = 1 WHERE id = ?")
            .bind(ip)
            .bind(name)
            .bind(host_id)
            .execute(self.db.pool())
            .await?;

        Ok(())
    }

    pub async fn add_host_origin(
        &self,
        host_id: &str,
        asn: u32,
        holder: &str,
    ) -> Result<(), DbError> {
        sqlx::query("INSERT INTO host_origin (host_id, asn, holder) VALUES (?, ?, ?)")
            .bind(host_id)
            .bind(asn as i64)
            .bind(holder)
            .execute(self.db.pool())
            .await?;

        Ok(())
    }

    pub async fn set_host_ixp_network(
        &self,
        host_id: &str,
        ixp: &IxpNetwork,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO host_ixp_network (host_id, lan_name, ix_name, ix_description)
             VALUES (?, ?, ?, ?)",
        )
        .bind(host_id)
        .bind(&ixp.lan_name)
        .bind(&ixp.ix_name)
        .bind(&ixp.ix_description)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Delete traceroutes older than `expiry`; the hop/host/origin/IXP
    /// children go with them through the cascades.
    pub async fn remove_old_entries(&self, expiry: Duration) -> Result<u64, DbError> {
        let cutoff = now_ts() - expiry.as_secs() as i64;

        let res = sqlx::query("DELETE FROM traceroute WHERE created < ?")
            .bind(cutoff)
            .execute(self.db.pool())
            .await?;

        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::traceroute::parsers::parse_raw_traceroute;
    use crate::traceroute::parsers::samples::MTR_JSON_REPORT;

    async fn store() -> TracerouteStore {
        TracerouteStore::new(test_db().await)
    }

    #[tokio::test]
    async fn create_parse_and_load() {
        let store = store().await;

        let t = store.create(MTR_JSON_REPORT).await.unwrap();
        assert!(!t.parsed);

        let parsed = parse_raw_traceroute(&t.raw).unwrap();
        store.store_parse_result(&t.id, &parsed.hops).await.unwrap();

        let t = store.get(&t.id).await.unwrap();
        assert!(t.parsed);

        let hops = store.load_hops(&t.id).await.unwrap();
        assert_eq!(hops.len(), 10);
        assert_eq!(hops[5].hop_number, 6);
        assert_eq!(hops[5].hosts[0].original_host, "62-101-124-17.fastres.net");
        assert_eq!(hops[5].hosts[0].avg_rtt, Some(59.78));
        assert!(!hops[5].hosts[0].enriched);
    }

    #[tokio::test]
    async fn host_enrichment_round_trip() {
        let store = store().await;

        let t = store.create(MTR_JSON_REPORT).await.unwrap();
        let parsed = parse_raw_traceroute(&t.raw).unwrap();
        store.store_parse_result(&t.id, &parsed.hops).await.unwrap();

        let hops = store.load_hops(&t.id).await.unwrap();
        let host_id = hops[5].hosts[0].id.clone();

        store
            .save_host_enrichment(
                &host_id,
                Some("62.101.124.17"),
                Some("62-101-124-17.fastres.net"),
            )
            .await
            .unwrap();
        store
            .add_host_origin(&host_id, 12874, "FASTWEB - Fastweb SpA")
            .await
            .unwrap();

        let host = store.get_host(&host_id).await.unwrap();
        assert!(host.enriched);
        assert!(host.is_global());
        assert_eq!(host.hop_number, 6);
        assert_eq!(
            host.origins,
            vec![HostOrigin {
                asn: 12874,
                holder: "FASTWEB - Fastweb SpA".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn lifecycle_flags() {
        let store = store().await;

        let t = store.create("raw").await.unwrap();
        store.mark_enrichment_started(&t.id).await.unwrap();
        store.mark_enrichment_completed(&t.id).await.unwrap();

        let t = store.get(&t.id).await.unwrap();
        assert!(t.enriched);
        assert!(t.enrichment_started.is_some());
        assert!(t.enrichment_completed.is_some());
        assert!(t.enrichment_completed >= t.enrichment_started);
    }

    #[tokio::test]
    async fn expired_traceroutes_are_removed_with_children() {
        let store = store().await;

        let t = store.create(MTR_JSON_REPORT).await.unwrap();
        let parsed = parse_raw_traceroute(&t.raw).unwrap();
        store.store_parse_result(&t.id, &parsed.hops).await.unwrap();

        // Backdate the record past the retention window.
        sqlx::query("UPDATE traceroute SET created = ? WHERE id = ?")
            .bind(now_ts() - 8 * 24 * 60 * 60)
            .bind(&t.id)
            .execute(store.db.pool())
            .await
            .unwrap();

        let removed = store
            .remove_old_entries(Duration::from_secs(7 * 24 * 60 * 60))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        assert!(store.get(&t.id).await.is_err());

        let hosts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM host")
            .fetch_one(store.db.pool())
            .await
            .unwrap();
        assert_eq!(hosts, 0);
    }
}
