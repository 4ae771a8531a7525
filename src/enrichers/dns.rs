//! Forward and reverse DNS with small in-memory TTL caches.
//!
//! Failures are soft: a host that doesn't resolve is enriched without a
//! name (or without an IP), never failed.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::time::Instant;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;

use crate::config::{DNS_CACHE_SIZE, DNS_CACHE_TTL, DNS_QUERY_TIMEOUT};
use crate::metrics::{Timed, LOOKUPS};

/// Forward/reverse name resolution as the enrichers see it. The system
/// resolver is the production implementation; tests plug in fixed tables.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn name_to_ip(&self, name: &str) -> Option<IpAddr>;
    async fn ip_to_name(&self, ip: IpAddr) -> Option<String>;
}

struct CacheEntry<V> {
    value: V,
    cached_at: Instant,
}

struct TtlCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;

        if entry.cached_at.elapsed() < DNS_CACHE_TTL {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn insert(&mut self, key: K, value: V) {
        if self.entries.len() >= DNS_CACHE_SIZE {
            self.entries
                .retain(|_, e| e.cached_at.elapsed() < DNS_CACHE_TTL);

            // Still full after dropping expired entries: evict the oldest.
            if self.entries.len() >= DNS_CACHE_SIZE {
                if let Some(oldest) = self
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.cached_at)
                    .map(|(k, _)| k.clone())
                {
                    self.entries.remove(&oldest);
                }
            }
        }

        self.entries.insert(
            key,
            CacheEntry {
                value,
                cached_at: Instant::now(),
            },
        );
    }
}

pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    forward_cache: Mutex<TtlCache<String, Option<IpAddr>>>,
    reverse_cache: Mutex<TtlCache<IpAddr, Option<String>>>,
}

impl DnsResolver {
    pub fn new() -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = DNS_QUERY_TIMEOUT;

        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            forward_cache: Mutex::new(TtlCache::new()),
            reverse_cache: Mutex::new(TtlCache::new()),
        }
    }
}

#[async_trait]
impl NameResolver for DnsResolver {
    /// Resolve a hostname to its first address.
    async fn name_to_ip(&self, name: &str) -> Option<IpAddr> {
        if let Some(cached) = self.forward_cache.lock().get(&name.to_string()) {
            return cached;
        }

        LOOKUPS.with_label_values(&["name_to_ip"]).inc();
        let _timing = Timed::with_descr("name_to_ip", name);

        let ip = match self.resolver.lookup_ip(name).await {
            Ok(lookup) => lookup.iter().next(),
            Err(_) => None,
        };

        self.forward_cache.lock().insert(name.to_string(), ip);

        ip
    }

    /// Resolve an address to its PTR name, without the trailing dot.
    async fn ip_to_name(&self, ip: IpAddr) -> Option<String> {
        if let Some(cached) = self.reverse_cache.lock().get(&ip) {
            return cached;
        }

        LOOKUPS.with_label_values(&["ip_to_name"]).inc();
        let _timing = Timed::with_descr("ip_to_name", ip.to_string());

        let name = match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Err(_) => None,
        };

        self.reverse_cache.lock().insert(ip, name.clone());

        name
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}
