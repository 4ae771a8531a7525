//! Periodic rebuild of the IXP peering-LAN prefix set from PeeringDB.
//!
//! Every run joins the `ix`, `ixlan` and `ixpfx` lists into one IP-info
//! record per LAN prefix (origins unset, IXP network populated), persists
//! each record and pushes it on the fan-out exchange so every consumer's
//! cache learns it. A failed PeeringDB query aborts the run silently; a
//! failed publish aborts the run too, and the next scheduled run retries.

use std::time::Duration;

use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::IXP_NETWORKS_UPDATE_INTERVAL;
use crate::errors::{BrokerError, ExternalSourceError};
use crate::ip_info::IpInfoStore;
use crate::metrics::{Timed, ERRORS};
use crate::structures::{IpDbInfo, IxpNetwork};

use super::broker::{IP_INFO_DATA_EXCHANGE_NAME, IP_INFO_TTL_MS};

pub const PEERINGDB_API_IX: &str = "https://www.peeringdb.com/api/ix";
pub const PEERINGDB_API_IXLAN: &str = "https://www.peeringdb.com/api/ixlan";
pub const PEERINGDB_API_IXPFX: &str = "https://www.peeringdb.com/api/ixpfx";

const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];
const MAX_RETRIES: u32 = 3;
const BACKOFF_FACTOR: u64 = 3;

#[derive(Debug, Deserialize)]
struct PdbResponse<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct PdbIx {
    pub id: u32,
    pub name: Option<String>,
    pub name_long: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PdbIxLan {
    pub id: u32,
    pub ix_id: u32,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PdbIxPfx {
    pub ixlan_id: u32,
    pub prefix: String,
}

/// PeeringDB client with the retry policy its API asks for: up to 3
/// retries on 429/5xx, exponential backoff, 30 s per request.
pub struct PeeringDb {
    client: reqwest::Client,
}

impl PeeringDb {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
        }
    }

    async fn query<T: DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Vec<T>, ExternalSourceError> {
        let _timing = Timed::with_descr("peeringdb.query", url);

        let mut retries = 0;

        loop {
            let result = self.client.get(url).send().await;

            let retryable = match &result {
                Ok(response) => {
                    RETRYABLE_STATUSES.contains(&response.status().as_u16())
                }
                Err(_) => false,
            };

            if retryable && retries < MAX_RETRIES {
                retries += 1;
                let delay = BACKOFF_FACTOR * 2u64.pow(retries - 1);

                warn!("PeeringDB query for {url} will be retried in {delay} s");
                tokio::time::sleep(Duration::from_secs(delay)).await;

                continue;
            }

            let response = result
                .and_then(|r| r.error_for_status())
                .map_err(|e| {
                    ERRORS.with_label_values(&["peeringdb_http"]).inc();
                    ExternalSourceError::Http {
                        url: url.to_string(),
                        source: e,
                    }
                })?;

            let body: PdbResponse<T> = response.json().await.map_err(|e| {
                ERRORS.with_label_values(&["peeringdb_http"]).inc();
                ExternalSourceError::Http {
                    url: url.to_string(),
                    source: e,
                }
            })?;

            return Ok(body.data);
        }
    }
}

impl Default for PeeringDb {
    fn default() -> Self {
        Self::new()
    }
}

/// Join the three PeeringDB lists into the per-prefix records to be
/// cached and persisted.
pub fn build_ixp_networks(
    ix_data: &[PdbIx],
    ixlan_data: &[PdbIxLan],
    ixpfx_data: &[PdbIxPfx],
) -> Vec<IpDbInfo> {
    let mut res = Vec::new();

    for ix in ix_data {
        for lan in ixlan_data.iter().filter(|lan| lan.ix_id == ix.id) {
            for pfx in ixpfx_data.iter().filter(|pfx| pfx.ixlan_id == lan.id) {
                let prefix = match pfx.prefix.parse() {
                    Ok(prefix) => prefix,
                    Err(_) => {
                        warn!("skipping unparsable IXP prefix: {}", pfx.prefix);
                        continue;
                    }
                };

                res.push(IpDbInfo::new(
                    prefix,
                    None,
                    Some(IxpNetwork {
                        lan_name: none_if_empty(&lan.name),
                        ix_name: none_if_empty(&ix.name),
                        ix_description: none_if_empty(&ix.name_long),
                    }),
                ));
            }
        }
    }

    res
}

fn none_if_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|s| !s.is_empty()).map(str::to_string)
}

/// Short-lived direct publisher onto the fan-out exchange, set up and
/// torn down around each run.
struct IxpFanoutPublisher {
    connection: Connection,
    channel: lapin::Channel,
}

impl IxpFanoutPublisher {
    async fn setup(amqp_url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .map_err(BrokerError::Connection)?;

        let channel = connection
            .create_channel()
            .await
            .map_err(BrokerError::Channel)?;

        channel
            .exchange_declare(
                IP_INFO_DATA_EXCHANGE_NAME,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Channel)?;

        Ok(Self {
            connection,
            channel,
        })
    }

    async fn publish(&self, info: &IpDbInfo) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                IP_INFO_DATA_EXCHANGE_NAME,
                "",
                BasicPublishOptions::default(),
                info.to_json().as_bytes(),
                BasicProperties::default().with_expiration(IP_INFO_TTL_MS.into()),
            )
            .await
            .map_err(BrokerError::Publish)?;

        Ok(())
    }

    async fn teardown(self) {
        let _ = self.channel.close(0, "IXP update done").await;
        let _ = self.connection.close(0, "IXP update done").await;
    }
}

pub struct IxpNetworksUpdater {
    amqp_url: String,
    ip_info_store: IpInfoStore,
    peeringdb: PeeringDb,
}

impl IxpNetworksUpdater {
    pub fn new(amqp_url: String, ip_info_store: IpInfoStore) -> Self {
        Self {
            amqp_url,
            ip_info_store,
            peeringdb: PeeringDb::new(),
        }
    }

    pub async fn update_ixp_networks(&self) {
        let _timing = Timed::new("build_ixp_networks");

        // Any failed list query aborts the run silently; the next
        // scheduled run retries.
        let ix_data: Vec<PdbIx> = match self.peeringdb.query(PEERINGDB_API_IX).await {
            Ok(data) => data,
            Err(e) => {
                error!("PeeringDB ix query failed: {e}");
                return;
            }
        };

        let ixlan_data: Vec<PdbIxLan> =
            match self.peeringdb.query(PEERINGDB_API_IXLAN).await {
                Ok(data) => data,
                Err(e) => {
                    error!("PeeringDB ixlan query failed: {e}");
                    return;
                }
            };

        let ixpfx_data: Vec<PdbIxPfx> =
            match self.peeringdb.query(PEERINGDB_API_IXPFX).await {
                Ok(data) => data,
                Err(e) => {
                    error!("PeeringDB ixpfx query failed: {e}");
                    return;
                }
            };

        let infos = build_ixp_networks(&ix_data, &ixlan_data, &ixpfx_data);
        info!("IXP networks update: {} prefixes", infos.len());

        let publisher = match IxpFanoutPublisher::setup(&self.amqp_url).await {
            Ok(publisher) => publisher,
            Err(e) => {
                error!("IXP networks update: broker setup failed: {e}");
                return;
            }
        };

        for ip_info in &infos {
            if let Err(e) = self.ip_info_store.upsert(ip_info).await {
                error!(
                    "unhandled error while creating the ip_info DB record \
                     for {}: {e}",
                    ip_info.prefix
                );
            }

            if let Err(e) = publisher.publish(ip_info).await {
                error!(
                    "unhandled error while dispatching the ip_info record \
                     for {}: {e}. Aborting the IXP networks update.",
                    ip_info.prefix
                );
                return;
            }
        }

        publisher.teardown().await;
    }
}

/// Periodic updater task: one kickoff at startup, then every
/// `IXP_NETWORKS_UPDATE_INTERVAL`.
pub fn spawn_ixp_networks_updater(
    amqp_url: String,
    ip_info_store: IpInfoStore,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let updater = IxpNetworksUpdater::new(amqp_url, ip_info_store);

        loop {
            info!("running the IXP networks updater");
            updater.update_ixp_networks().await;
            info!("IXP networks updater completed");

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(IXP_NETWORKS_UPDATE_INTERVAL) => {}
            }
        }
    })
}
