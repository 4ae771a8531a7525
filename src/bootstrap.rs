//! Process bootstrap: builds the long-lived components and spawns the
//! mode-appropriate task set.
//!
//! Worker mode runs the full pipeline: the jobs dispatcher, the IP-info
//! dispatcher, the event emitter, C consumers (each with K enrichers),
//! the IXP networks updater and the housekeeper. Web mode only runs the
//! jobs dispatcher: submissions are created there and enriched elsewhere.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, Mode};
use crate::db::Db;
use crate::enrichers::consumer::{spawn_consumer, ConsumerDeps, ConsumerWorker};
use crate::enrichers::dispatcher::{
    spawn_enrichment_jobs_dispatcher, spawn_ipinfo_dispatcher, EnrichmentJobsDispatcher,
};
use crate::enrichers::dns::DnsResolver;
use crate::enrichers::events::spawn_event_emitter;
use crate::enrichers::external::RipeStatClient;
use crate::enrichers::ixp_networks::spawn_ixp_networks_updater;
use crate::housekeeping::spawn_housekeeper;
use crate::ip_info::IpInfoStore;
use crate::traceroute::TracerouteStore;

pub struct Environment {
    pub store: TracerouteStore,
    pub ip_info_store: IpInfoStore,
    pub jobs_dispatcher: EnrichmentJobsDispatcher,
    pub cancel: CancellationToken,

    db: Db,
    consumers: Vec<ConsumerWorker>,
    tasks: Vec<JoinHandle<()>>,
}

pub async fn setup_environment(config: &Config, mode: Mode) -> anyhow::Result<Environment> {
    info!("setting up the environment...");

    let cancel = CancellationToken::new();
    let amqp_url = config.rabbitmq.amqp_url();

    let db = Db::connect(&config.db).await?;
    let store = TracerouteStore::new(db.clone());
    let ip_info_store = IpInfoStore::new(db.clone());

    let mut tasks = Vec::new();
    let mut consumers = Vec::new();

    info!("spinning up the workers [job dispatcher]...");
    let (jobs_dispatcher, handle) = spawn_enrichment_jobs_dispatcher(&amqp_url, &cancel);
    tasks.push(handle);

    if mode == Mode::Worker {
        info!("spinning up the workers [IP info dispatcher]...");
        let (ipinfo_dispatcher, handle) = spawn_ipinfo_dispatcher(&amqp_url, &cancel);
        tasks.push(handle);

        info!("spinning up the workers [event emitter]...");
        let (events, handle) = spawn_event_emitter(&amqp_url, &cancel);
        tasks.push(handle);

        let deps = ConsumerDeps {
            amqp_url: amqp_url.clone(),
            store: store.clone(),
            ip_info_store: ip_info_store.clone(),
            dns: Arc::new(DnsResolver::new()),
            external: Arc::new(RipeStatClient::new()),
            ipinfo_dispatcher,
            events,
        };

        info!(
            "spinning up the workers [{} consumers x {} enrichers]...",
            config.workers.consumers, config.workers.enrichers
        );
        for n in 0..config.workers.consumers {
            consumers.push(spawn_consumer(
                format!("consumer-{n}"),
                config.workers.enrichers,
                &deps,
                &cancel,
            ));
        }

        info!("spinning up the IXP networks updater...");
        tasks.push(spawn_ixp_networks_updater(
            amqp_url.clone(),
            ip_info_store.clone(),
            cancel.clone(),
        ));

        info!("spinning up the house keeper...");
        tasks.push(spawn_housekeeper(
            store.clone(),
            ip_info_store.clone(),
            cancel.clone(),
        ));
    }

    info!("environment setup completed");

    Ok(Environment {
        store,
        ip_info_store,
        jobs_dispatcher,
        cancel,
        db,
        consumers,
        tasks,
    })
}

impl Environment {
    /// Block until every spawned task has finished (they only do after a
    /// cooperative stop).
    pub async fn wait(&mut self) {
        for consumer in &mut self.consumers {
            consumer.wait().await;
        }

        for task in &mut self.tasks {
            let _ = task.await;
        }
    }

    /// Cooperative shutdown: enricher sentinels, broker cancel + close,
    /// dispatcher drain-then-stop, then the DB pool.
    pub async fn shutdown(self) {
        info!("stopping");

        for consumer in self.consumers {
            consumer.stop().await;
        }

        self.cancel.cancel();

        for task in self.tasks {
            // Tasks already joined by wait() must not be polled again.
            if !task.is_finished() {
                let _ = task.await;
            }
        }

        self.db.close().await;

        info!("stopped");
    }
}
