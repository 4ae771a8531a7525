//! DDL for both backends.
//!
//! Timestamps are BIGINT unix-epoch seconds, booleans BIGINT 0/1: the
//! lowest common denominator the `Any` driver handles identically on
//! sqlite and MySQL.

use super::{Db, Flavor};
use crate::errors::DbError;

fn statements(flavor: Flavor) -> Vec<String> {
    // sqlite wants INTEGER PRIMARY KEY for rowid aliasing; MySQL wants
    // explicit AUTO_INCREMENT.
    let auto_pk = match flavor {
        Flavor::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
        Flavor::Mysql => "id BIGINT NOT NULL PRIMARY KEY AUTO_INCREMENT",
    };

    vec![
        "CREATE TABLE IF NOT EXISTS traceroute (
            id VARCHAR(40) NOT NULL PRIMARY KEY,
            raw TEXT NOT NULL,
            created BIGINT NOT NULL,
            last_seen BIGINT NOT NULL,
            parsed BIGINT NOT NULL DEFAULT 0,
            enriched BIGINT NOT NULL DEFAULT 0,
            enrichment_started BIGINT NULL,
            enrichment_completed BIGINT NULL
        )"
        .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS hop (
                {auto_pk},
                traceroute_id VARCHAR(40) NOT NULL,
                hop_number BIGINT NOT NULL,
                FOREIGN KEY (traceroute_id) REFERENCES traceroute(id) ON DELETE CASCADE
            )"
        ),
        "CREATE TABLE IF NOT EXISTS host (
            id VARCHAR(40) NOT NULL PRIMARY KEY,
            hop_id BIGINT NOT NULL,
            original_host VARCHAR(255) NOT NULL,
            avg_rtt DOUBLE NULL,
            min_rtt DOUBLE NULL,
            max_rtt DOUBLE NULL,
            loss DOUBLE NULL,
            ip VARCHAR(45) NULL,
            name VARCHAR(255) NULL,
            enriched BIGINT NOT NULL DEFAULT 0,
            FOREIGN KEY (hop_id) REFERENCES hop(id) ON DELETE CASCADE
        )"
        .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS host_origin (
                {auto_pk},
                host_id VARCHAR(40) NOT NULL,
                asn BIGINT NOT NULL,
                holder VARCHAR(256) NOT NULL,
                FOREIGN KEY (host_id) REFERENCES host(id) ON DELETE CASCADE
            )"
        ),
        "CREATE TABLE IF NOT EXISTS host_ixp_network (
            host_id VARCHAR(40) NOT NULL PRIMARY KEY,
            lan_name VARCHAR(255) NULL,
            ix_name VARCHAR(255) NULL,
            ix_description VARCHAR(255) NULL,
            FOREIGN KEY (host_id) REFERENCES host(id) ON DELETE CASCADE
        )"
        .to_string(),
        // 39: max length of a textual IPv6 address.
        "CREATE TABLE IF NOT EXISTS ip_info_prefix (
            prefix VARCHAR(39) NOT NULL PRIMARY KEY,
            last_updated BIGINT NOT NULL
        )"
        .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS ip_info_origin (
                {auto_pk},
                prefix VARCHAR(39) NOT NULL,
                asn BIGINT NOT NULL,
                holder VARCHAR(256) NOT NULL,
                FOREIGN KEY (prefix) REFERENCES ip_info_prefix(prefix) ON DELETE CASCADE
            )"
        ),
        "CREATE TABLE IF NOT EXISTS ip_info_ixp_network (
            prefix VARCHAR(39) NOT NULL PRIMARY KEY,
            lan_name VARCHAR(255) NULL,
            ix_name VARCHAR(255) NULL,
            ix_description VARCHAR(255) NULL,
            FOREIGN KEY (prefix) REFERENCES ip_info_prefix(prefix) ON DELETE CASCADE
        )"
        .to_string(),
    ]
}

pub async fn create_tables(db: &Db) -> Result<(), DbError> {
    for stmt in statements(db.flavor()) {
        sqlx::query(&stmt).execute(db.pool()).await?;
    }

    Ok(())
}
