//! Persisted prefix → (origins, IXP network) records, the durable side of
//! the enrichers' in-memory cache.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use sqlx::Row;

use crate::db::{now_ts, ts_to_datetime, Db};
use crate::errors::DbError;
use crate::structures::{IpDbInfo, IxpNetwork};

#[derive(Clone)]
pub struct IpInfoStore {
    db: Db,
}

impl IpInfoStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create or replace the record for `info.prefix`.
    ///
    /// On replace the origin/IXP children are dropped and re-inserted in
    /// the same transaction and `last_updated` is bumped, so readers never
    /// observe a half-updated prefix and duplicates cannot accumulate.
    pub async fn upsert(&self, info: &IpDbInfo) -> Result<(), DbError> {
        let prefix = info.prefix.to_string();
        let mut tx = self.db.pool().begin().await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT prefix FROM ip_info_prefix WHERE prefix = ?")
                .bind(&prefix)
                .fetch_optional(&mut *tx)
                .await?;

        if existing.is_some() {
            sqlx::query("UPDATE ip_info_prefix SET last_updated = ? WHERE prefix = ?")
                .bind(now_ts())
                .bind(&prefix)
                .execute(&mut *tx)
                .await?;

            sqlx::query("DELETE FROM ip_info_origin WHERE prefix = ?")
                .bind(&prefix)
                .execute(&mut *tx)
                .await?;

            sqlx::query("DELETE FROM ip_info_ixp_network WHERE prefix = ?")
                .bind(&prefix)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("INSERT INTO ip_info_prefix (prefix, last_updated) VALUES (?, ?)")
                .bind(&prefix)
                .bind(now_ts())
                .execute(&mut *tx)
                .await?;
        }

        for (asn, holder) in info.origins.iter().flatten() {
            sqlx::query("INSERT INTO ip_info_origin (prefix, asn, holder) VALUES (?, ?, ?)")
                .bind(&prefix)
                .bind(*asn as i64)
                .bind(holder)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(ixp) = &info.ixp_network {
            sqlx::query(
                "INSERT INTO ip_info_ixp_network (prefix, lan_name, ix_name, ix_description)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&prefix)
            .bind(&ixp.lan_name)
            .bind(&ixp.ix_name)
            .bind(&ixp.ix_description)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    pub async fn get(
        &self,
        prefix: &IpNetwork,
    ) -> Result<Option<(IpDbInfo, DateTime<Utc>)>, DbError> {
        let prefix_str = prefix.to_string();

        let row = sqlx::query("SELECT last_updated FROM ip_info_prefix WHERE prefix = ?")
            .bind(&prefix_str)
            .fetch_optional(self.db.pool())
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let last_updated = ts_to_datetime(row.try_get("last_updated")?);
        let info = self.load_children(*prefix).await?;

        Ok(Some((info, last_updated)))
    }

    async fn load_children(&self, prefix: IpNetwork) -> Result<IpDbInfo, DbError> {
        let prefix_str = prefix.to_string();

        let origin_rows = sqlx::query(
            "SELECT asn, holder FROM ip_info_origin WHERE prefix = ? ORDER BY id",
        )
        .bind(&prefix_str)
        .fetch_all(self.db.pool())
        .await?;

        let origins: Vec<(u32, String)> = origin_rows
            .iter()
            .map(|row| {
                Ok((
                    row.try_get::<i64, _>("asn")? as u32,
                    row.try_get("holder")?,
                ))
            })
            .collect::<Result<_, sqlx::Error>>()?;

        let ixp_network = sqlx::query(
            "SELECT lan_name, ix_name, ix_description FROM ip_info_ixp_network
             WHERE prefix = ?",
        )
        .bind(&prefix_str)
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

        Ok(IpDbInfo::new(
            prefix,
            if origins.is_empty() {
                None
            } else {
                Some(origins)
            },
            ixp_network,
        ))
    }

    /// Every stored record with its `last_updated`, for the enrichers'
    /// cache warm-up.
    pub async fn load_all(&self) -> Result<Vec<(IpDbInfo, DateTime<Utc>)>, DbError> {
        let rows = sqlx::query("SELECT prefix, last_updated FROM ip_info_prefix")
            .fetch_all(self.db.pool())
            .await?;

        let mut res = Vec::with_capacity(rows.len());

        for row in rows {
            let prefix_str: String = row.try_get("prefix")?;
            let prefix: IpNetwork = prefix_str.parse().map_err(|_| DbError::BadValue {
                column: "ip_info_prefix.prefix".to_string(),
                value: prefix_str.clone(),
            })?;

            let last_updated = ts_to_datetime(row.try_get("last_updated")?);
            res.push((self.load_children(prefix).await?, last_updated));
        }

        Ok(res)
    }

    pub async fn remove_old_entries(&self, expiry: Duration) -> Result<u64, DbError> {
        let cutoff = now_ts() - expiry.as_secs() as i64;

        let res = sqlx::query("DELETE FROM ip_info_prefix WHERE last_updated <= ?")
            .bind(cutoff)
            .execute(self.db.pool())
            .await?;

        Ok(res.rows_affected())
    }

    #[cfg(test)]
    pub(crate) async fn counts(&self) -> (i64, i64, i64) {
        let prefixes = sqlx::query_scalar("SELECT COUNT(*) FROM ip_info_prefix")
            .fetch_one(self.db.pool())
            .await
            .unwrap();
        let origins = sqlx::query_scalar("SELECT COUNT(*) FROM ip_info_origin")
            .fetch_one(self.db.pool())
            .await
            .unwrap();
        let ixps = sqlx::query_scalar("SELECT COUNT(*) FROM ip_info_ixp_network")
            .fetch_one(self.db.pool())
            .await
            .unwrap();

        (prefixes, origins, ixps)
    }
}
