//! Outbound publishers: enrichment jobs and IP-info fan-out messages.
//!
//! Each dispatcher is a cheap cloneable handle over an in-memory queue; a
//! dedicated broker-client task (the publisher loop in `broker`) drains it
//! once a second. Items must tolerate duplicate delivery: jobs re-read DB
//! state downstream, IP-info updates are last-writer-wins per prefix.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::structures::{EnricherJob, IpDbInfo};

use super::broker::{
    BrokerClient, ChannelProfile, ChannelRole, ChannelSetup, OutboundMessage,
    OutboundQueue, ENRICHMENT_JOBS_QUEUE_NAME, ENRICHMENT_JOBS_TTL_MS,
    IP_INFO_DATA_EXCHANGE_NAME, IP_INFO_TTL_MS,
};

#[derive(Clone)]
pub struct EnrichmentJobsDispatcher {
    outbound: OutboundQueue,
}

impl EnrichmentJobsDispatcher {
    pub fn dispatch(&self, job: &EnricherJob) {
        self.outbound.push(OutboundMessage {
            routing_key: None,
            payload: job.to_json(),
            ttl_ms: ENRICHMENT_JOBS_TTL_MS,
        });
    }

    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    #[cfg(test)]
    pub(crate) fn outbound_for_tests(&self) -> &OutboundQueue {
        &self.outbound
    }
}

#[derive(Clone)]
pub struct IpInfoDispatcher {
    outbound: OutboundQueue,
}

impl IpInfoDispatcher {
    pub fn dispatch(&self, info: &IpDbInfo) {
        self.outbound.push(OutboundMessage {
            routing_key: None,
            payload: info.to_json(),
            ttl_ms: IP_INFO_TTL_MS,
        });
    }

    pub fn pending(&self) -> usize {
        self.outbound.len()
    }
}

/// Spawn the jobs publisher task. The returned handle can be cloned into
/// everything that submits traceroutes.
pub fn spawn_enrichment_jobs_dispatcher(
    amqp_url: &str,
    cancel: &CancellationToken,
) -> (EnrichmentJobsDispatcher, JoinHandle<()>) {
    let outbound = OutboundQueue::new();

    let client = BrokerClient::new(
        amqp_url.to_string(),
        vec![ChannelSetup {
            profile: ChannelProfile::enrichment_jobs_publisher(),
            role: ChannelRole::Publish {
                outbound: outbound.clone(),
                routing: ("", ENRICHMENT_JOBS_QUEUE_NAME),
            },
        }],
        cancel.clone(),
    );

    let handle = tokio::spawn(async move { client.run().await });

    (EnrichmentJobsDispatcher { outbound }, handle)
}

/// Spawn the IP-info fan-out publisher task.
pub fn spawn_ipinfo_dispatcher(
    amqp_url: &str,
    cancel: &CancellationToken,
) -> (IpInfoDispatcher, JoinHandle<()>) {
    let outbound = OutboundQueue::new();

    let client = BrokerClient::new(
        amqp_url.to_string(),
        vec![ChannelSetup {
            profile: ChannelProfile::ip_info_publisher(),
            role: ChannelRole::Publish {
                outbound: outbound.clone(),
                routing: (IP_INFO_DATA_EXCHANGE_NAME, ""),
            },
        }],
        cancel.clone(),
    );

    let handle = tokio::spawn(async move { client.run().await });

    (IpInfoDispatcher { outbound }, handle)
}

/// Dispatcher handles detached from any broker task, for tests that only
/// need to observe what would have been published.
#[cfg(test)]
pub(crate) fn detached_dispatchers() -> (EnrichmentJobsDispatcher, IpInfoDispatcher) {
    (
        EnrichmentJobsDispatcher {
            outbound: OutboundQueue::new(),
        },
        IpInfoDispatcher {
            outbound: OutboundQueue::new(),
        },
    )
}
