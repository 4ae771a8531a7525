//! Database plumbing.
//!
//! One `Db` handle serves both backends: sqlite for single-node setups and
//! tests, MySQL for production. Queries go through the sqlx `Any` driver,
//! so all binds stick to i64/f64/String and timestamps are stored as
//! unix-epoch seconds.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use sqlx::any::{AnyPoolOptions, install_default_drivers};
use sqlx::AnyPool;
use tracing::{info, warn};

use crate::config::DbConfig;
use crate::errors::DbError;

mod schema;

pub use schema::create_tables;

/// Upper bound for the reconnect backoff.
const MAX_CONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Sqlite,
    Mysql,
}

#[derive(Clone)]
pub struct Db {
    pool: AnyPool,
    flavor: Flavor,
}

impl Db {
    /// Connect to the configured database, retrying transient failures
    /// with a doubling backoff capped at 60 s. After every successful
    /// connection the tables are re-created best-effort: a no-op when they
    /// already exist, and what makes fresh test environments work.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        install_default_drivers();

        let flavor = if config.is_sqlite() {
            Flavor::Sqlite
        } else {
            Flavor::Mysql
        };

        let url = config.url();
        let mut delay = Duration::from_secs(1);

        loop {
            match Self::try_connect(&url, flavor).await {
                Ok(db) => {
                    if let Err(e) = create_tables(&db).await {
                        warn!("table creation after connect failed: {e}");
                    }

                    return Ok(db);
                }
                Err(e) if is_transient(&e) => {
                    delay = (delay * 2).min(MAX_CONNECT_DELAY);

                    warn!(
                        "connection to the database failed: {e}. \
                         Attempting a new connection in {} seconds...",
                        delay.as_secs()
                    );

                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(DbError::Query(e)),
            }
        }
    }

    async fn try_connect(url: &str, flavor: Flavor) -> Result<Self, sqlx::Error> {
        let mut options = AnyPoolOptions::new().max_connections(10);

        if flavor == Flavor::Sqlite {
            // Cascading deletes on the child tables depend on this pragma;
            // it is per-connection, hence the hook.
            options = options.after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON")
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            });

            // In-memory sqlite databases exist per connection: more than
            // one connection means more than one (empty) database.
            if url.contains(":memory:") {
                options = options.max_connections(1);
            }
        }

        info!("connecting to the database...");
        let pool = options.connect(url).await?;

        Ok(Self { pool, flavor })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)
    ) || matches!(err, sqlx::Error::Database(e) if {
        let msg = e.message().to_lowercase();
        msg.contains("connection") || msg.contains("server has gone away")
    })
}

/// 40-hex record id, the primary key format for traceroutes and hosts.
pub fn record_uid() -> String {
    let mut buf = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
pub(crate) async fn test_db() -> Db {
    let db = Db::connect(&DbConfig::Sqlite {
        path: ":memory:".to_string(),
    })
    .await
    .expect("in-memory sqlite");

    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_uid_is_40_hex() {
        let id = record_uid();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(record_uid(), id);
    }

    #[tokio::test]
    async fn connect_creates_tables() {
        let db = test_db().await;

        // Idempotent: a second pass must not fail.
        create_tables(&db).await.unwrap();

        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM traceroute")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
