//! The enrichment pipeline: broker plumbing, dispatchers, consumers,
//! enrichers, the IXP prefix refresher and the notification emitter.

pub mod broker;
pub mod consumer;
pub mod dispatcher;
pub mod dns;
pub mod enricher;
pub mod events;
pub mod external;
pub mod ixp_networks;
pub mod trie;
