use thiserror::Error;

/// Fatal configuration problem detected at startup.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A parser could not make sense of the input. Recoverable: the registry
/// just moves on to the next parser.
#[derive(Debug, Error)]
#[error("parse error: {0}")]
pub struct ParseError(pub String);

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Broker-side failure. Triggers a reconnect with backoff, never fatal.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(#[source] lapin::Error),

    #[error("broker channel failed: {0}")]
    Channel(#[source] lapin::Error),

    #[error("broker consumer failed: {0}")]
    Consumer(#[source] lapin::Error),

    #[error("broker publish failed: {0}")]
    Publish(#[source] lapin::Error),
}

/// Database-level failure, propagated to the caller once the driver's own
/// reconnect handling has given up.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid value in {column}: {value}")]
    BadValue { column: String, value: String },
}

/// A remote registry (RIPEstat, PeeringDB) could not be queried or returned
/// an unusable answer. Lookups return `None`, enrichment proceeds without
/// origin data.
#[derive(Debug, Error)]
pub enum ExternalSourceError {
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned status {status}")]
    BadStatus { service: String, status: String },

    #[error("unexpected payload from {service}: {detail}")]
    BadPayload { service: String, detail: String },
}

/// Unhandled failure inside a per-host enrichment step. Logged, counted,
/// surfaced as a host-level error event; the job continues with the next
/// host.
#[derive(Debug, Error)]
#[error("enrichment failed for host {host_id}: {detail}")]
pub struct EnrichmentError {
    pub host_id: String,
    pub detail: String,
}
