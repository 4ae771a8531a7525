//! The enricher: takes one job at a time and attaches DNS, origin-AS and
//! IXP facts to every host of the traceroute, emitting an event per host
//! and a terminal event when done.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::DbError;
use crate::ip_info::IpInfoStore;
use crate::metrics::{Timed, ERRORS};
use crate::net::ip_is_global;
use crate::structures::{EnricherJob, EnricherJobHost, IpDbInfo};
use crate::traceroute::{to_text, Host, TracerouteStore};

use super::dispatcher::IpInfoDispatcher;
use super::dns::NameResolver;
use super::external::ExternalSources;
use super::trie::IpInfoCache;

/// A job handed to an enricher; `None` is the stop sentinel.
pub type JobSlot = Option<EnricherJob>;

/// The shared handoff queue end the enrichers of one consumer pull from.
pub type SharedJobReceiver = Arc<AsyncMutex<mpsc::Receiver<JobSlot>>>;

pub struct Enricher {
    pub name: String,
    cache: Arc<IpInfoCache>,
    dns: Arc<dyn NameResolver>,
    external: Arc<dyn ExternalSources>,
    store: TracerouteStore,
    ip_info_store: IpInfoStore,
    ipinfo_dispatcher: IpInfoDispatcher,
    events: super::events::EventEmitter,
}

impl Enricher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        cache: Arc<IpInfoCache>,
        dns: Arc<dyn NameResolver>,
        external: Arc<dyn ExternalSources>,
        store: TracerouteStore,
        ip_info_store: IpInfoStore,
        ipinfo_dispatcher: IpInfoDispatcher,
        events: super::events::EventEmitter,
    ) -> Self {
        Self {
            name,
            cache,
            dns,
            external,
            store,
            ip_info_store,
            ipinfo_dispatcher,
            events,
        }
    }

    /// Upsert into the shared LPM cache; with `dispatch_to_others` the
    /// record also goes out on the fan-out bus for the other workers.
    pub fn add_ip_info_to_local_cache(
        &self,
        info: IpDbInfo,
        dispatch_to_others: bool,
        last_updated: DateTime<Utc>,
    ) {
        self.cache.add(info.clone(), last_updated);

        if dispatch_to_others {
            debug!("dispatching IP info to other workers: {}", info.prefix);
            self.ipinfo_dispatcher.dispatch(&info);
        }
    }

    async fn save_ip_info_to_db(&self, info: &IpDbInfo) {
        if let Err(e) = self.ip_info_store.upsert(info).await {
            error!(
                "unhandled error while creating the ip_info DB record \
                 for {}: {e}",
                info.prefix
            );
        }
    }

    /// Enrich one host: DNS both ways, cache/external origin lookup, DB
    /// update. Returns the updated host row for the event payload.
    async fn enrich_host(&self, job_host: &EnricherJobHost) -> anyhow::Result<Host> {
        let mut host_ip: Option<IpAddr> = job_host.host.parse().ok();
        let mut host_name: Option<String> = if host_ip.is_none() {
            Some(job_host.host.clone())
        } else {
            None
        };

        match host_ip {
            Some(ip) => {
                if ip_is_global(ip) {
                    host_name = self.dns.ip_to_name(ip).await;
                }
            }
            None => {
                if let Some(name) = &host_name {
                    host_ip = self.dns.name_to_ip(name).await;
                }
            }
        }

        let mut ip_info: Option<IpDbInfo> = None;

        if let Some(ip) = host_ip {
            if ip_is_global(ip) {
                ip_info = self.cache.get(ip);

                match &ip_info {
                    Some(_) => debug!("IP info for {ip} found in the cache"),
                    None => {
                        debug!("IP info for {ip} not found; gathering them");

                        ip_info = self.external.ip_info(ip).await;

                        if let Some(info) = &ip_info {
                            self.add_ip_info_to_local_cache(info.clone(), true, Utc::now());
                            self.save_ip_info_to_db(info).await;
                        }
                    }
                }

                debug!("host data: {ip} / {host_name:?} / {ip_info:?}");
            }
        }

        self.store
            .save_host_enrichment(
                &job_host.host_id,
                host_ip.map(|ip| ip.to_string()).as_deref(),
                host_name.as_deref(),
            )
            .await?;

        if let Some(info) = &ip_info {
            for (asn, holder) in info.origins.iter().flatten() {
                self.store
                    .add_host_origin(&job_host.host_id, *asn, holder)
                    .await?;
            }

            if let Some(ixp) = &info.ixp_network {
                self.store
                    .set_host_ixp_network(&job_host.host_id, ixp)
                    .await?;
            }
        }

        Ok(self.store.get_host(&job_host.host_id).await?)
    }

    /// Work through a whole job. A failing host is reported through an
    /// error event and skipped; the job itself never aborts on host
    /// errors.
    pub async fn process_traceroute_enrichment_job(
        &self,
        job: &EnricherJob,
    ) -> Result<(), DbError> {
        self.store.get(&job.traceroute_id).await?;
        self.store
            .mark_enrichment_started(&job.traceroute_id)
            .await?;

        for job_host in &job.hosts {
            let result = {
                let _timing = Timed::with_descr("enrich_host", &job_host.host);
                self.enrich_host(job_host).await
            };

            match result {
                Ok(db_host) => {
                    self.events
                        .host_enriched(&job.traceroute_id, db_host.to_dict());
                }
                Err(e) => {
                    error!(
                        "unhandled error while enriching host ID {} for \
                         hop n. {} of traceroute {}: {e}",
                        job_host.host_id, job_host.hop_n, job.traceroute_id
                    );

                    ERRORS.with_label_values(&["enrich_host"]).inc();

                    self.events.host_enrichment_error(
                        &job.traceroute_id,
                        job_host.hop_n,
                        &job_host.host_id,
                        "An error occurred while enriching \
                         the information for this host.",
                    );
                }
            }
        }

        self.store
            .mark_enrichment_completed(&job.traceroute_id)
            .await?;

        let traceroute = self.store.get(&job.traceroute_id).await?;
        let hops = self.store.load_hops(&job.traceroute_id).await?;

        self.events.enrichment_completed(
            &traceroute.id,
            traceroute.to_dict(&hops),
            to_text(&hops),
        );

        Ok(())
    }

    /// Pull jobs from the shared handoff queue until the stop sentinel
    /// (or a closed channel).
    pub async fn run(self, jobs: SharedJobReceiver) {
        info!("{} ready to process jobs", self.name);

        loop {
            let job = { jobs.lock().await.recv().await };

            let Some(Some(job)) = job else {
                info!("{} stopping", self.name);
                return;
            };

            if let Err(e) = self.process_traceroute_enrichment_job(&job).await {
                error!(
                    "{}: unhandled error while processing the job {}: {e}",
                    self.name,
                    job.to_json()
                );
            }
        }
    }
}

/// Stream every stored IP-info record into the cache. Scheduled once per
/// consumer, shortly after startup.
pub async fn load_ip_info_entries_from_db(
    cache: &IpInfoCache,
    store: &IpInfoStore,
) -> Result<usize, DbError> {
    info!("loading IP info entries from DB...");

    let _timing = Timed::new("load_ip_info_entries_from_db");

    let entries = store.load_all().await?;
    let count = entries.len();

    for (info, last_updated) in entries {
        cache.add(info, last_updated);
    }

    info!("IP info entries loaded ({count})");

    Ok(count)
}

/// Delayed cache warm-up: a random 1..120 s delay keeps a fleet of
/// restarting workers from hammering the database all at once.
pub fn spawn_cache_warm_up(
    cache: Arc<IpInfoCache>,
    store: IpInfoStore,
    cancel: CancellationToken,
) {
    let delay = std::time::Duration::from_secs(rand::thread_rng().gen_range(1..120));

    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                if let Err(e) = load_ip_info_entries_from_db(&cache, &store).await {
                    error!("IP info cache warm-up failed: {e}");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ipnetwork::IpNetwork;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    use crate::db::test_db;
    use crate::enrichers::dispatcher::detached_dispatchers;
    use crate::enrichers::events::detached_emitter;
    use crate::structures::IxpNetwork;
    use crate::traceroute::enrichment_job;
    use crate::traceroute::parsers::parse_raw_traceroute;
    use crate::traceroute::parsers::samples::{MTR_JSON_REPORT, MTR_JSON_VIA_IXP};

    struct FakeSources {
        answers: Vec<(IpNetwork, IpDbInfo)>,
        calls: Mutex<Vec<IpAddr>>,
    }

    impl FakeSources {
        fn new(answers: Vec<(&str, IpDbInfo)>) -> Self {
            Self {
                answers: answers
                    .into_iter()
                    .map(|(net, info)| (net.parse().unwrap(), info))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<IpAddr> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ExternalSources for FakeSources {
        async fn ip_info(&self, ip: IpAddr) -> Option<IpDbInfo> {
            self.calls.lock().push(ip);

            self.answers
                .iter()
                .find(|(net, _)| net.contains(ip))
                .map(|(_, info)| info.clone())
        }
    }

    struct StaticResolver {
        forward: HashMap<String, IpAddr>,
        reverse: HashMap<IpAddr, String>,
    }

    #[async_trait]
    impl NameResolver for StaticResolver {
        async fn name_to_ip(&self, name: &str) -> Option<IpAddr> {
            self.forward.get(name).copied()
        }

        async fn ip_to_name(&self, ip: IpAddr) -> Option<String> {
            self.reverse.get(&ip).cloned()
        }
    }

    fn origins_info(prefix: &str, asn: u32, holder: &str) -> IpDbInfo {
        IpDbInfo::new(
            prefix.parse().unwrap(),
            Some(vec![(asn, holder.to_string())]),
            None,
        )
    }

    struct Harness {
        store: TracerouteStore,
        ip_info_store: IpInfoStore,
        cache: Arc<IpInfoCache>,
        sources: Arc<FakeSources>,
        enricher: Enricher,
    }

    async fn harness(sources: FakeSources) -> Harness {
        let db = test_db().await;
        let store = TracerouteStore::new(db.clone());
        let ip_info_store = IpInfoStore::new(db);
        let cache = Arc::new(IpInfoCache::new());
        let sources = Arc::new(sources);
        let (_, ipinfo_dispatcher) = detached_dispatchers();

        let mut forward = HashMap::new();
        forward.insert(
            "62-101-124-17.fastres.net".to_string(),
            "62.101.124.17".parse().unwrap(),
        );
        forward.insert("dns.google".to_string(), "8.8.8.8".parse().unwrap());

        let mut reverse = HashMap::new();
        reverse.insert(
            "62.101.124.17".parse().unwrap(),
            "62-101-124-17.fastres.net".to_string(),
        );
        reverse.insert("8.8.8.8".parse().unwrap(), "dns.google".to_string());

        let enricher = Enricher::new(
            "enricher-0".to_string(),
            Arc::clone(&cache),
            Arc::new(StaticResolver { forward, reverse }),
            Arc::clone(&sources) as Arc<dyn ExternalSources>,
            store.clone(),
            ip_info_store.clone(),
            ipinfo_dispatcher,
            detached_emitter(),
        );

        Harness {
            store,
            ip_info_store,
            cache,
            sources,
            enricher,
        }
    }

    fn default_sources() -> FakeSources {
        FakeSources::new(vec![
            ("89.97.0.0/16", origins_info("89.97.0.0/16", 12874, "FASTWEB - Fastweb SpA")),
            ("62.101.112.0/20", origins_info("62.101.112.0/20", 12874, "FASTWEB - Fastweb SpA")),
            ("209.85.128.0/17", origins_info("209.85.128.0/17", 15169, "GOOGLE")),
            ("216.239.32.0/19", origins_info("216.239.32.0/19", 15169, "GOOGLE")),
            ("8.8.8.0/24", origins_info("8.8.8.0/24", 15169, "GOOGLE")),
        ])
    }

    async fn submit(h: &Harness, raw: &str) -> String {
        let t = h.store.create(raw).await.unwrap();
        let parsed = parse_raw_traceroute(raw).unwrap();
        h.store.store_parse_result(&t.id, &parsed.hops).await.unwrap();

        let hops = h.store.load_hops(&t.id).await.unwrap();
        let job = enrichment_job(&t.id, &hops);

        h.enricher
            .process_traceroute_enrichment_job(&job)
            .await
            .unwrap();

        t.id
    }

    #[tokio::test]
    async fn basic_enrichment() {
        let h = harness(default_sources()).await;
        let id = submit(&h, MTR_JSON_REPORT).await;

        // One external lookup per distinct globally routable prefix. Hop 9
        // (216.239.50.241) is covered by the /19 learnt at hop 8 and must
        // not trigger a new call.
        let expected: Vec<IpAddr> = [
            "89.97.200.190",
            "62.101.124.17",
            "209.85.168.64",
            "216.239.51.9",
            "8.8.8.8",
        ]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();
        assert_eq!(h.sources.calls(), expected);

        let t = h.store.get(&id).await.unwrap();
        assert!(t.parsed);
        assert!(t.enriched);
        assert!(t.enrichment_started.is_some());
        assert!(t.enrichment_completed >= t.enrichment_started);

        let hops = h.store.load_hops(&id).await.unwrap();
        assert_eq!(hops.len(), 10);

        let h1 = &hops[0].hosts[0];
        assert_eq!(h1.original_host, "192.168.1.254");
        assert_eq!(h1.ip.as_deref(), Some("192.168.1.254"));
        assert_eq!(h1.name, None);
        assert!(h1.enriched);
        assert!(h1.origins.is_empty());

        let h6 = &hops[5].hosts[0];
        assert_eq!(h6.original_host, "62-101-124-17.fastres.net");
        assert_eq!(h6.ip.as_deref(), Some("62.101.124.17"));
        assert_eq!(h6.name.as_deref(), Some("62-101-124-17.fastres.net"));
        assert_eq!(h6.origins.len(), 1);
        assert_eq!(h6.origins[0].asn, 12874);
        assert_eq!(h6.origins[0].holder, "FASTWEB - Fastweb SpA");

        let h10 = &hops[9].hosts[0];
        assert_eq!(h10.original_host, "dns.google");
        assert_eq!(h10.ip.as_deref(), Some("8.8.8.8"));
        assert_eq!(h10.name.as_deref(), Some("dns.google"));
        assert_eq!(h10.origins[0].asn, 15169);
        assert_eq!(h10.origins[0].holder, "GOOGLE");

        // The JSON projection matches.
        let dict = t.to_dict(&hops);
        assert_eq!(dict["status"], "enriched");
        assert_eq!(dict["hops"]["1"][0]["ip"], "192.168.1.254");
        assert_eq!(dict["hops"]["1"][0]["origins"], serde_json::Value::Null);
        assert_eq!(dict["hops"]["10"][0]["origins"][0][1], "GOOGLE");
    }

    #[tokio::test]
    async fn events_end_with_the_terminal_one() {
        let h = harness(default_sources()).await;
        submit(&h, MTR_JSON_REPORT).await;

        let mut events = Vec::new();
        while let Some(msg) = h.enricher.events.outbound_for_tests().pop() {
            let envelope: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
            events.push(envelope["event"].as_str().unwrap().to_string());
        }

        assert_eq!(events.len(), 11);
        assert!(events[..10]
            .iter()
            .all(|e| e == "traceroute_host_enriched"));
        assert_eq!(events[10], "traceroute_enrichment_completed");
    }

    #[tokio::test]
    async fn lpm_cache_prevents_duplicate_lookups_across_jobs() {
        let h = harness(default_sources()).await;
        submit(&h, MTR_JSON_REPORT).await;
        let first_run = h.sources.calls().len();

        submit(&h, MTR_JSON_REPORT).await;

        // Everything came from the cache the second time.
        assert_eq!(h.sources.calls().len(), first_run);

        // No duplicate IPInfo rows either.
        let all = h.ip_info_store.load_all().await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn expired_cache_entry_is_refetched() {
        let h = harness(default_sources()).await;
        submit(&h, MTR_JSON_REPORT).await;
        let first_run = h.sources.calls().len();

        h.cache.backdate(
            &"89.97.0.0/16".parse().unwrap(),
            Utc::now() - chrono::Duration::days(365),
        );

        submit(&h, MTR_JSON_REPORT).await;

        let calls = h.sources.calls();
        assert_eq!(calls.len(), first_run + 1);
        assert_eq!(calls.last().unwrap().to_string(), "89.97.200.190");
    }

    #[tokio::test]
    async fn ixp_hop_gets_the_lan_from_the_cache() {
        let h = harness(FakeSources::new(vec![
            ("89.97.0.0/16", origins_info("89.97.0.0/16", 12874, "FASTWEB - Fastweb SpA")),
            ("93.62.0.0/15", origins_info("93.62.0.0/15", 12874, "FASTWEB - Fastweb SpA")),
            ("217.29.72.0/21", origins_info("217.29.72.0/21", 16004, "MIX-IT")),
        ]))
        .await;

        // What the IXP updater would have fanned out.
        h.enricher.add_ip_info_to_local_cache(
            IpDbInfo::new(
                "217.29.66.0/23".parse().unwrap(),
                None,
                Some(IxpNetwork {
                    lan_name: None,
                    ix_name: Some("MIX-IT".to_string()),
                    ix_description: Some("Milan Internet eXchange".to_string()),
                }),
            ),
            false,
            Utc::now(),
        );

        let id = submit(&h, MTR_JSON_VIA_IXP).await;

        let hops = h.store.load_hops(&id).await.unwrap();
        let h7 = &hops[6].hosts[0];
        assert_eq!(h7.ip.as_deref(), Some("217.29.66.1"));
        assert!(h7.origins.is_empty());
        let ixp = h7.ixp_network.as_ref().unwrap();
        assert_eq!(ixp.lan_name, None);
        assert_eq!(ixp.ix_name.as_deref(), Some("MIX-IT"));
        assert_eq!(ixp.ix_description.as_deref(), Some("Milan Internet eXchange"));

        // No external call for the IXP hop.
        assert!(!h
            .sources
            .calls()
            .contains(&"217.29.66.1".parse().unwrap()));

        // Rendered text shows the IX in the origin column.
        let text = to_text(&hops);
        assert!(text.contains("IX: MIX-IT"));
    }

    #[tokio::test]
    async fn moas_prefix_creates_one_origin_row_per_asn() {
        let h = harness(FakeSources::new(vec![(
            "8.8.8.0/24",
            IpDbInfo::new(
                "8.8.8.0/24".parse().unwrap(),
                Some(vec![
                    (15169, "GOOGLE".to_string()),
                    (396982, "GOOGLE-CLOUD-PLATFORM".to_string()),
                ]),
                None,
            ),
        )]))
        .await;

        let raw = r#"{
            "report": {
                "hubs": [
                    {"count": 1, "host": "8.8.8.8", "Loss%": 0.0, "Avg": 5.0, "Best": 4.0, "Wrst": 6.0}
                ]
            }
        }"#;

        let id = submit(&h, raw).await;

        let hops = h.store.load_hops(&id).await.unwrap();
        let host = &hops[0].hosts[0];
        assert_eq!(host.origins.len(), 2);

        let text = to_text(&hops);
        assert!(text.contains("AS15169"));
        assert!(text.contains("AS396982"));
        // The reverse name shows up once only.
        assert_eq!(text.matches("dns.google").count(), 1);
    }

    #[tokio::test]
    async fn dispatch_flag_controls_fanout() {
        let h = harness(default_sources()).await;

        let info = origins_info("192.0.2.0/24", 65500, "test");

        h.enricher
            .add_ip_info_to_local_cache(info.clone(), false, Utc::now());
        assert_eq!(h.enricher.ipinfo_dispatcher.pending(), 0);

        h.enricher
            .add_ip_info_to_local_cache(info, true, Utc::now());
        assert_eq!(h.enricher.ipinfo_dispatcher.pending(), 1);
    }

    #[tokio::test]
    async fn warm_up_loads_every_stored_record() {
        let h = harness(default_sources()).await;

        h.ip_info_store
            .upsert(&origins_info("192.0.2.0/24", 65500, "test"))
            .await
            .unwrap();
        h.ip_info_store
            .upsert(&origins_info("198.51.100.0/24", 65501, "test 2"))
            .await
            .unwrap();

        let loaded = load_ip_info_entries_from_db(&h.cache, &h.ip_info_store)
            .await
            .unwrap();

        assert_eq!(loaded, 2);
        assert_eq!(h.cache.len(), 2);
    }
}
