// Public API: wire types, stores, the parser registry and the worker
// bootstrap.
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod enrichers;
pub mod errors;
pub mod housekeeping;
pub mod ip_info;
pub mod metrics;
pub mod net;
pub mod structures;
pub mod traceroute;
