//! The consumer worker: one broker client (jobs queue + IP-info fan-out)
//! feeding a pool of enrichers through a capacity-1 handoff queue.
//!
//! Back-pressure is the handoff queue itself: when it already holds an
//! unclaimed job, new deliveries are negative-acked with requeue so the
//! broker hands them to a worker with idle enrichers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ip_info::IpInfoStore;
use crate::structures::{EnricherJob, IpDbInfo};
use crate::traceroute::TracerouteStore;

use super::broker::{
    BrokerClient, ChannelProfile, ChannelRole, ChannelSetup, MessageDisposition,
    MessageHandler,
};
use super::dispatcher::IpInfoDispatcher;
use super::dns::NameResolver;
use super::enricher::{spawn_cache_warm_up, Enricher, JobSlot};
use super::events::EventEmitter;
use super::external::ExternalSources;
use super::trie::IpInfoCache;

/// Everything a consumer needs to wire its enrichers up.
#[derive(Clone)]
pub struct ConsumerDeps {
    pub amqp_url: String,
    pub store: TracerouteStore,
    pub ip_info_store: IpInfoStore,
    pub dns: Arc<dyn NameResolver>,
    pub external: Arc<dyn ExternalSources>,
    pub ipinfo_dispatcher: IpInfoDispatcher,
    pub events: EventEmitter,
}

struct JobsHandler {
    jobs_tx: mpsc::Sender<JobSlot>,
}

#[async_trait]
impl MessageHandler for JobsHandler {
    async fn handle(&self, payload: &[u8]) -> MessageDisposition {
        let job = match EnricherJob::from_json(payload) {
            Ok(job) => job,
            Err(e) => {
                // Malformed jobs are acked away; requeueing them would
                // loop forever.
                warn!("dropping undecodable enrichment job: {e}");
                return MessageDisposition::Ack;
            }
        };

        match self.jobs_tx.try_send(Some(job)) {
            Ok(()) => {
                debug!("got a job");
                MessageDisposition::Ack
            }
            Err(_) => {
                debug!("job rejected, all enrichers busy");
                MessageDisposition::NackRequeue
            }
        }
    }
}

struct IpInfoHandler {
    cache: Arc<IpInfoCache>,
}

#[async_trait]
impl MessageHandler for IpInfoHandler {
    async fn handle(&self, payload: &[u8]) -> MessageDisposition {
        match IpDbInfo::from_json(payload) {
            Ok(info) => {
                debug!("got IP DB info data: {}", info.prefix);
                self.cache.add(info, Utc::now());
            }
            Err(e) => {
                warn!("dropping undecodable IP info update: {e}");
            }
        }

        MessageDisposition::Ack
    }
}

pub struct ConsumerWorker {
    name: String,
    jobs_tx: mpsc::Sender<JobSlot>,
    enricher_count: usize,
    enricher_handles: Vec<JoinHandle<()>>,
    broker_handle: JoinHandle<()>,
    broker_cancel: CancellationToken,
}

/// Spawn a consumer: its broker client, its enrichers and the one-shot
/// cache warm-up.
pub fn spawn_consumer(
    name: String,
    enrichers_per_consumer: u32,
    deps: &ConsumerDeps,
    cancel: &CancellationToken,
) -> ConsumerWorker {
    let cache = Arc::new(IpInfoCache::new());

    let (jobs_tx, jobs_rx) = mpsc::channel::<JobSlot>(1);
    let jobs_rx = Arc::new(AsyncMutex::new(jobs_rx));

    let mut enricher_handles = Vec::with_capacity(enrichers_per_consumer as usize);

    for n in 0..enrichers_per_consumer {
        let enricher = Enricher::new(
            format!("{name}-enricher-{n}"),
            Arc::clone(&cache),
            Arc::clone(&deps.dns),
            Arc::clone(&deps.external),
            deps.store.clone(),
            deps.ip_info_store.clone(),
            deps.ipinfo_dispatcher.clone(),
            deps.events.clone(),
        );

        let jobs_rx = Arc::clone(&jobs_rx);
        enricher_handles.push(tokio::spawn(async move { enricher.run(jobs_rx).await }));
    }

    spawn_cache_warm_up(
        Arc::clone(&cache),
        deps.ip_info_store.clone(),
        cancel.clone(),
    );

    let broker_cancel = cancel.child_token();

    let client = BrokerClient::new(
        deps.amqp_url.clone(),
        vec![
            ChannelSetup {
                profile: ChannelProfile::enrichment_jobs_consumer(),
                role: ChannelRole::Consume(Arc::new(JobsHandler {
                    jobs_tx: jobs_tx.clone(),
                })),
            },
            ChannelSetup {
                profile: ChannelProfile::ip_info_consumer(),
                role: ChannelRole::Consume(Arc::new(IpInfoHandler {
                    cache: Arc::clone(&cache),
                })),
            },
        ],
        broker_cancel.clone(),
    );

    let broker_handle = tokio::spawn(async move { client.run().await });

    ConsumerWorker {
        name,
        jobs_tx,
        enricher_count: enrichers_per_consumer as usize,
        enricher_handles,
        broker_handle,
        broker_cancel,
    }
}

impl ConsumerWorker {
    /// Cooperative shutdown: a stop sentinel per enricher, then the
    /// broker client.
    pub async fn stop(self) {
        debug!("{}: stopping enrichers...", self.name);

        for _ in 0..self.enricher_count {
            if self.jobs_tx.send(None).await.is_err() {
                break;
            }
        }

        for handle in self.enricher_handles {
            let _ = handle.await;
        }

        debug!("{}: stopping the broker client...", self.name);
        self.broker_cancel.cancel();
        if !self.broker_handle.is_finished() {
            let _ = self.broker_handle.await;
        }
    }

    /// Run until the broker client exits (on cooperative stop).
    pub async fn wait(&mut self) {
        let _ = (&mut self.broker_handle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::EnricherJobHost;

    fn job_payload() -> Vec<u8> {
        EnricherJob {
            traceroute_id: "t1".into(),
            hosts: vec![EnricherJobHost {
                hop_n: 1,
                host_id: "h1".into(),
                host: "192.0.2.1".into(),
            }],
        }
        .to_json()
        .into_bytes()
    }

    #[tokio::test]
    async fn busy_worker_nacks_with_requeue() {
        let (jobs_tx, mut jobs_rx) = mpsc::channel::<JobSlot>(1);
        let handler = JobsHandler { jobs_tx };

        // First job fits the capacity-1 handoff queue.
        assert!(matches!(
            handler.handle(&job_payload()).await,
            MessageDisposition::Ack
        ));

        // Second one finds it occupied: back-pressure kicks in.
        assert!(matches!(
            handler.handle(&job_payload()).await,
            MessageDisposition::NackRequeue
        ));

        // Once an enricher claimed the pending job, the next delivery is
        // accepted again.
        jobs_rx.recv().await.unwrap();
        assert!(matches!(
            handler.handle(&job_payload()).await,
            MessageDisposition::Ack
        ));
    }

    #[tokio::test]
    async fn malformed_jobs_are_acked_away() {
        let (jobs_tx, _jobs_rx) = mpsc::channel::<JobSlot>(1);
        let handler = JobsHandler { jobs_tx };

        assert!(matches!(
            handler.handle(b"not json at all").await,
            MessageDisposition::Ack
        ));
    }

    #[tokio::test]
    async fn fanout_updates_land_in_the_shared_cache() {
        let cache = Arc::new(IpInfoCache::new());
        let handler = IpInfoHandler {
            cache: Arc::clone(&cache),
        };

        let info = IpDbInfo::new(
            "216.239.32.0/19".parse().unwrap(),
            Some(vec![(15169, "GOOGLE".into())]),
            None,
        );

        assert!(matches!(
            handler.handle(info.to_json().as_bytes()).await,
            MessageDisposition::Ack
        ));

        let found = cache.get("216.239.51.9".parse().unwrap()).unwrap();
        assert_eq!(found.prefix.to_string(), "216.239.32.0/19");

        // Junk on the fan-out is acked and ignored.
        assert!(matches!(
            handler.handle(b"junk").await,
            MessageDisposition::Ack
        ));
        assert_eq!(cache.len(), 1);
    }
}
