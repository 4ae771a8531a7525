//! Longest-prefix-match cache for IP info records.
//!
//! A binary radix trie per address family, shared by all enrichers of a
//! consumer behind a mutex. Entries expire after `IP_INFO_EXPIRY`:
//! expired entries are dropped on lookup and reported as misses, which is
//! what triggers a fresh external lookup.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use parking_lot::Mutex;

use crate::config::IP_INFO_EXPIRY;
use crate::structures::IpDbInfo;

#[derive(Debug, Clone)]
struct Entry {
    info: IpDbInfo,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Node {
    children: [Option<Box<Node>>; 2],
    entry: Option<Entry>,
}

/// Binary trie keyed by CIDR, one root per address family.
#[derive(Debug, Default)]
pub struct PrefixTrie {
    v4: Node,
    v6: Node,
    len: usize,
}

impl PrefixTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert or replace the entry for `info.prefix`.
    pub fn insert(&mut self, info: IpDbInfo, last_updated: DateTime<Utc>) {
        let prefix = info.prefix;
        let (root, bits) = match prefix {
            IpNetwork::V4(net) => (&mut self.v4, u128::from(u32::from(net.network())) << 96),
            IpNetwork::V6(net) => (&mut self.v6, u128::from(net.network())),
        };

        let mut node = root;
        for i in 0..prefix.prefix() {
            let bit = ((bits >> (127 - i)) & 1) as usize;
            node = node.children[bit].get_or_insert_with(Default::default);
        }

        if node.entry.is_none() {
            self.len += 1;
        }

        node.entry = Some(Entry { info, last_updated });
    }

    /// Longest-prefix match for `ip`.
    pub fn lookup_best(&self, ip: IpAddr) -> Option<(IpDbInfo, DateTime<Utc>)> {
        let (root, bits, max_depth) = match ip {
            IpAddr::V4(v4) => (&self.v4, u128::from(u32::from(v4)) << 96, 32),
            IpAddr::V6(v6) => (&self.v6, u128::from(v6), 128),
        };

        let mut best: Option<&Entry> = None;
        let mut node = root;

        if let Some(entry) = &node.entry {
            best = Some(entry);
        }

        for i in 0..max_depth {
            let bit = ((bits >> (127 - i)) & 1) as usize;
            match &node.children[bit] {
                Some(child) => {
                    node = child;
                    if let Some(entry) = &node.entry {
                        best = Some(entry);
                    }
                }
                None => break,
            }
        }

        best.map(|e| (e.info.clone(), e.last_updated))
    }

    /// Drop the entry for `prefix`, if present.
    pub fn remove(&mut self, prefix: &IpNetwork) {
        let (root, bits) = match prefix {
            IpNetwork::V4(net) => (&mut self.v4, u128::from(u32::from(net.network())) << 96),
            IpNetwork::V6(net) => (&mut self.v6, u128::from(net.network())),
        };

        let mut node = root;
        for i in 0..prefix.prefix() {
            let bit = ((bits >> (127 - i)) & 1) as usize;
            match &mut node.children[bit] {
                Some(child) => node = child,
                None => return,
            }
        }

        if node.entry.take().is_some() {
            self.len -= 1;
        }
    }
}

/// The shared cache: trie + expiry policy behind a mutex.
pub struct IpInfoCache {
    trie: Mutex<PrefixTrie>,
}

impl IpInfoCache {
    pub fn new() -> Self {
        Self {
            trie: Mutex::new(PrefixTrie::new()),
        }
    }

    /// LPM lookup. Entries older than `IP_INFO_EXPIRY` are removed and
    /// reported as misses.
    pub fn get(&self, ip: IpAddr) -> Option<IpDbInfo> {
        let mut trie = self.trie.lock();

        let (info, last_updated) = trie.lookup_best(ip)?;

        let expiry = chrono::Duration::from_std(IP_INFO_EXPIRY).unwrap();
        if last_updated < Utc::now() - expiry {
            trie.remove(&info.prefix);
            return None;
        }

        Some(info)
    }

    pub fn add(&self, info: IpDbInfo, last_updated: DateTime<Utc>) {
        self.trie.lock().insert(info, last_updated);
    }

    pub fn len(&self) -> usize {
        self.trie.lock().len()
    }

    /// Force an entry's age, used by tests to simulate expiry.
    #[cfg(test)]
    pub(crate) fn backdate(&self, prefix: &IpNetwork, last_updated: DateTime<Utc>) {
        let mut trie = self.trie.lock();
        if let Some((info, _)) = trie.lookup_best(prefix.network()) {
            if info.prefix == *prefix {
                trie.insert(info, last_updated);
            }
        }
    }
}

impl Default for IpInfoCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn info(prefix: &str) -> IpDbInfo {
        IpDbInfo::new(prefix.parse().unwrap(), None, None)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn longest_match_wins() {
        let mut trie = PrefixTrie::new();
        trie.insert(info("216.239.32.0/19"), Utc::now());
        trie.insert(info("216.239.51.0/24"), Utc::now());

        let (found, _) = trie.lookup_best(ip("216.239.51.9")).unwrap();
        assert_eq!(found.prefix.to_string(), "216.239.51.0/24");

        let (found, _) = trie.lookup_best(ip("216.239.50.241")).unwrap();
        assert_eq!(found.prefix.to_string(), "216.239.32.0/19");

        assert!(trie.lookup_best(ip("8.8.8.8")).is_none());
    }

    #[test]
    fn families_do_not_mix() {
        let mut trie = PrefixTrie::new();
        trie.insert(info("0.0.0.0/0"), Utc::now());

        assert!(trie.lookup_best(ip("192.0.2.1")).is_some());
        assert!(trie.lookup_best(ip("2001:db8::1")).is_none());
    }

    #[test]
    fn insert_replaces_and_remove_drops() {
        let mut trie = PrefixTrie::new();
        trie.insert(info("10.0.0.0/8"), Utc::now());
        trie.insert(info("10.0.0.0/8"), Utc::now());
        assert_eq!(trie.len(), 1);

        trie.remove(&"10.0.0.0/8".parse().unwrap());
        assert_eq!(trie.len(), 0);
        assert!(trie.lookup_best(ip("10.1.2.3")).is_none());

        // Removing a missing prefix is a no-op.
        trie.remove(&"10.0.0.0/8".parse().unwrap());
        assert_eq!(trie.len(), 0);
    }

    #[test]
    fn ipv6_lookups() {
        let mut trie = PrefixTrie::new();
        trie.insert(info("2001:7f8:b::/48"), Utc::now());
        trie.insert(info("2001:7f8::/32"), Utc::now());

        let (found, _) = trie.lookup_best(ip("2001:7f8:b::1")).unwrap();
        assert_eq!(found.prefix.to_string(), "2001:7f8:b::/48");

        let (found, _) = trie.lookup_best(ip("2001:7f8:c::1")).unwrap();
        assert_eq!(found.prefix.to_string(), "2001:7f8::/32");
    }

    #[test]
    fn cache_expires_entries_on_lookup() {
        let cache = IpInfoCache::new();
        let prefix: IpNetwork = "89.97.0.0/16".parse().unwrap();

        cache.add(info("89.97.0.0/16"), Utc::now());
        assert!(cache.get(ip("89.97.200.190")).is_some());

        cache.backdate(&prefix, Utc::now() - chrono::Duration::days(365));

        // Expired: dropped and reported as a miss, twice in a row.
        assert!(cache.get(ip("89.97.200.190")).is_none());
        assert!(cache.get(ip("89.97.200.190")).is_none());
        assert_eq!(cache.len(), 0);
    }

    proptest! {
        /// The trie agrees with a naive linear longest-prefix scan.
        #[test]
        fn lpm_matches_linear_scan(
            prefixes in proptest::collection::vec((any::<u32>(), 8u8..=30), 1..20),
            probe in any::<u32>(),
        ) {
            let mut trie = PrefixTrie::new();
            let mut nets: Vec<IpNetwork> = Vec::new();

            for (addr, len) in prefixes {
                let net: IpNetwork = format!(
                    "{}/{}",
                    std::net::Ipv4Addr::from(addr & (u32::MAX << (32 - len))),
                    len
                )
                .parse()
                .unwrap();

                if !nets.contains(&net) {
                    nets.push(net);
                }
                trie.insert(IpDbInfo::new(net, None, None), Utc::now());
            }

            let probe_ip = IpAddr::V4(std::net::Ipv4Addr::from(probe));

            let expected = nets
                .iter()
                .filter(|net| net.contains(probe_ip))
                .max_by_key(|net| net.prefix())
                .cloned();

            let got = trie.lookup_best(probe_ip).map(|(info, _)| info.prefix);

            prop_assert_eq!(got, expected);
        }
    }
}
