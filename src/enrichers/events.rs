//! Per-traceroute notification events.
//!
//! Events go out on a broker-backed topic exchange with the room name as
//! the routing key, so any process can emit into any room no matter where
//! the subscribers are connected. Rooms are named `/t/{traceroute_id}`.

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{
    ENRICHMENT_COMPLETED_EVENT, HOST_ENRICHED_EVENT, HOST_ENRICHMENT_ERROR_EVENT,
};

use super::broker::{
    BrokerClient, ChannelProfile, ChannelRole, ChannelSetup, OutboundMessage,
    OutboundQueue, EVENTS_TTL_MS, TRACEROUTE_EVENTS_EXCHANGE_NAME,
};

pub fn room_for(traceroute_id: &str) -> String {
    format!("/t/{traceroute_id}")
}

#[derive(Clone)]
pub struct EventEmitter {
    outbound: OutboundQueue,
}

impl EventEmitter {
    fn emit(&self, event: &str, traceroute_id: &str, data: serde_json::Value) {
        let room = room_for(traceroute_id);

        let envelope = json!({
            "event": event,
            "namespace": room,
            "data": data,
        });

        self.outbound.push(OutboundMessage {
            routing_key: Some(room),
            payload: envelope.to_string(),
            ttl_ms: EVENTS_TTL_MS,
        });
    }

    /// A host has been enriched; `host` is its full dict projection.
    pub fn host_enriched(&self, traceroute_id: &str, host: serde_json::Value) {
        let mut data = json!({ "traceroute_id": traceroute_id });

        if let (Some(data_obj), Some(host_obj)) = (data.as_object_mut(), host.as_object()) {
            for (k, v) in host_obj {
                data_obj.insert(k.clone(), v.clone());
            }
        }

        self.emit(HOST_ENRICHED_EVENT, traceroute_id, data);
    }

    pub fn host_enrichment_error(
        &self,
        traceroute_id: &str,
        hop_n: u32,
        host_id: &str,
        error: &str,
    ) {
        self.emit(
            HOST_ENRICHMENT_ERROR_EVENT,
            traceroute_id,
            json!({
                "traceroute_id": traceroute_id,
                "hop_n": hop_n,
                "host_id": host_id,
                "error": error,
            }),
        );
    }

    /// Terminal event: the whole traceroute dict plus its text rendering.
    pub fn enrichment_completed(
        &self,
        traceroute_id: &str,
        traceroute: serde_json::Value,
        text: String,
    ) {
        self.emit(
            ENRICHMENT_COMPLETED_EVENT,
            traceroute_id,
            json!({
                "traceroute_id": traceroute_id,
                "traceroute": traceroute,
                "text": text,
            }),
        );
    }

    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    #[cfg(test)]
    pub(crate) fn outbound_for_tests(&self) -> &OutboundQueue {
        &self.outbound
    }
}

/// Spawn the events publisher task for this process.
pub fn spawn_event_emitter(
    amqp_url: &str,
    cancel: &CancellationToken,
) -> (EventEmitter, JoinHandle<()>) {
    let outbound = OutboundQueue::new();

    let client = BrokerClient::new(
        amqp_url.to_string(),
        vec![ChannelSetup {
            profile: ChannelProfile::events_publisher(),
            role: ChannelRole::Publish {
                outbound: outbound.clone(),
                routing: (TRACEROUTE_EVENTS_EXCHANGE_NAME, ""),
            },
        }],
        cancel.clone(),
    );

    let handle = tokio::spawn(async move { client.run().await });

    (EventEmitter { outbound }, handle)
}

/// An emitter detached from any broker task; events pile up in memory.
/// Used by tests to assert on the emitted stream.
#[cfg(test)]
pub(crate) fn detached_emitter() -> EventEmitter {
    EventEmitter {
        outbound: OutboundQueue::new(),
    }
}
