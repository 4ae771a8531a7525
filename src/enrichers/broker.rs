//! Reconnecting AMQP client.
//!
//! One `BrokerClient` owns one connection and drives a fixed set of
//! channels, each walked through an explicit state machine:
//!
//! ```text
//! Init → Open → [ExchangeDeclared] → [QueueDeclared] → [Bound]
//!      → [QosSet] → Ready → (Consuming | Publishing) → Cancelling → Closed
//! ```
//!
//! The optional stages depend on the channel profile. All state
//! transitions happen on the client's single task, so they need no
//! locking. An outer reconnect loop rebuilds the connection and
//! redeclares every channel after a failure, sleeping
//! `min(attempts, 30)` seconds in between.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PUBLISH_INTERVAL;
use crate::errors::BrokerError;

pub const ENRICHMENT_JOBS_QUEUE_NAME: &str = "enrichment_jobs";
pub const IP_INFO_DATA_EXCHANGE_NAME: &str = "ip_info_data";
pub const TRACEROUTE_EVENTS_EXCHANGE_NAME: &str = "traceroute_events";

/// Per-message TTLs, in milliseconds as AMQP wants them.
pub const ENRICHMENT_JOBS_TTL_MS: &str = "120000";
pub const IP_INFO_TTL_MS: &str = "60000";
pub const EVENTS_TTL_MS: &str = "60000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    Open,
    ExchangeDeclared,
    QueueDeclared,
    Bound,
    QosSet,
    Ready,
    Consuming,
    Publishing,
    Cancelling,
    Closed,
}

/// What a channel declares and how it is used.
#[derive(Clone)]
pub struct ChannelProfile {
    pub name: &'static str,
    /// Exchange to declare, if any.
    pub exchange: Option<(&'static str, ExchangeKind)>,
    /// Queue to declare, if any. An empty name asks the broker for an
    /// anonymous queue.
    pub queue: Option<QueueProfile>,
    /// Bind the declared queue to the declared exchange.
    pub bind: bool,
    pub prefetch: Option<u16>,
}

#[derive(Clone)]
pub struct QueueProfile {
    pub name: &'static str,
    pub exclusive: bool,
}

impl ChannelProfile {
    /// The named jobs queue, manual ack, prefetch 1.
    pub fn enrichment_jobs_consumer() -> Self {
        Self {
            name: "enrichment_jobs_channel",
            exchange: None,
            queue: Some(QueueProfile {
                name: ENRICHMENT_JOBS_QUEUE_NAME,
                exclusive: false,
            }),
            bind: false,
            prefetch: Some(1),
        }
    }

    /// Anonymous exclusive queue bound to the fan-out exchange.
    pub fn ip_info_consumer() -> Self {
        Self {
            name: "ip_db_info_channel",
            exchange: Some((IP_INFO_DATA_EXCHANGE_NAME, ExchangeKind::Fanout)),
            queue: Some(QueueProfile {
                name: "",
                exclusive: true,
            }),
            bind: true,
            prefetch: Some(10),
        }
    }

    /// Publisher onto the jobs queue through the default exchange.
    pub fn enrichment_jobs_publisher() -> Self {
        Self {
            name: "traceroute_dispatcher",
            exchange: None,
            queue: Some(QueueProfile {
                name: ENRICHMENT_JOBS_QUEUE_NAME,
                exclusive: false,
            }),
            bind: false,
            prefetch: None,
        }
    }

    pub fn ip_info_publisher() -> Self {
        Self {
            name: "ipinfo_dispatcher",
            exchange: Some((IP_INFO_DATA_EXCHANGE_NAME, ExchangeKind::Fanout)),
            queue: None,
            bind: false,
            prefetch: None,
        }
    }

    /// Room-scoped notification events: topic exchange, the room is the
    /// routing key.
    pub fn events_publisher() -> Self {
        Self {
            name: "events_dispatcher",
            exchange: Some((TRACEROUTE_EVENTS_EXCHANGE_NAME, ExchangeKind::Topic)),
            queue: None,
            bind: false,
            prefetch: None,
        }
    }
}

/// A message waiting to be published: payload plus its routing.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Routing key override; the profile's default routing applies when
    /// absent.
    pub routing_key: Option<String>,
    pub payload: String,
    pub ttl_ms: &'static str,
}

/// In-memory outbound queue shared between the dispatchers' `dispatch()`
/// callers and the publisher loop. Messages survive broker outages here
/// until their channel comes back.
#[derive(Clone, Default)]
pub struct OutboundQueue {
    inner: Arc<Mutex<VecDeque<OutboundMessage>>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, msg: OutboundMessage) {
        self.inner.lock().push_back(msg);
    }

    pub(crate) fn pop(&self) -> Option<OutboundMessage> {
        self.inner.lock().pop_front()
    }

    fn push_front(&self, msg: OutboundMessage) {
        self.inner.lock().push_front(msg);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// How a consumed message was handled.
pub enum MessageDisposition {
    Ack,
    /// Negative-ack with requeue: another worker will pick the message
    /// up.
    NackRequeue,
}

/// Consumer-side callback, one per consuming channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> MessageDisposition;
}

/// What a channel does once it is `Ready`.
pub enum ChannelRole {
    Consume(Arc<dyn MessageHandler>),
    Publish {
        outbound: OutboundQueue,
        /// Default routing: (exchange, routing key).
        routing: (&'static str, &'static str),
    },
}

pub struct ChannelSetup {
    pub profile: ChannelProfile,
    pub role: ChannelRole,
}

/// Driver for one channel: owns the lapin channel and its state.
struct ChannelDriver {
    profile: ChannelProfile,
    state: ChannelState,
    channel: Option<lapin::Channel>,
    /// Actual queue name, relevant for anonymous queues.
    declared_queue: Option<String>,
    consumer_tag: Option<String>,
}

impl ChannelDriver {
    fn new(profile: ChannelProfile) -> Self {
        Self {
            profile,
            state: ChannelState::Init,
            channel: None,
            declared_queue: None,
            consumer_tag: None,
        }
    }

    fn set_state(&mut self, state: ChannelState) {
        debug!("{} - {:?} -> {:?}", self.profile.name, self.state, state);
        self.state = state;
    }

    /// Walk the declare/bind/qos stages up to `Ready`.
    async fn setup(&mut self, connection: &Connection) -> Result<(), BrokerError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(BrokerError::Channel)?;
        self.set_state(ChannelState::Open);

        if let Some((exchange, kind)) = &self.profile.exchange {
            channel
                .exchange_declare(
                    exchange,
                    kind.clone(),
                    ExchangeDeclareOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(BrokerError::Channel)?;
            self.set_state(ChannelState::ExchangeDeclared);
        }

        if let Some(queue) = &self.profile.queue {
            let declared = channel
                .queue_declare(
                    queue.name,
                    QueueDeclareOptions {
                        passive: false,
                        durable: false,
                        exclusive: queue.exclusive,
                        auto_delete: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(BrokerError::Channel)?;

            self.declared_queue = Some(declared.name().as_str().to_string());
            self.set_state(ChannelState::QueueDeclared);
        }

        if self.profile.bind {
            let (exchange, _) = self
                .profile
                .exchange
                .as_ref()
                .expect("bind requires an exchange");
            let queue = self
                .declared_queue
                .as_deref()
                .expect("bind requires a queue");

            channel
                .queue_bind(
                    queue,
                    exchange,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(BrokerError::Channel)?;
            self.set_state(ChannelState::Bound);
        }

        if let Some(prefetch) = self.profile.prefetch {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(BrokerError::Channel)?;
            self.set_state(ChannelState::QosSet);
        }

        self.channel = Some(channel);
        self.set_state(ChannelState::Ready);

        Ok(())
    }

    async fn start_consuming(&mut self) -> Result<lapin::Consumer, BrokerError> {
        let channel = self.channel.as_ref().expect("channel not set up");
        let queue = self
            .declared_queue
            .as_deref()
            .expect("consuming requires a queue");

        let consumer = channel
            .basic_consume(
                queue,
                &format!("{}-consumer", self.profile.name),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Consumer)?;

        self.consumer_tag = Some(consumer.tag().as_str().to_string());
        self.set_state(ChannelState::Consuming);

        Ok(consumer)
    }

    /// Drain the outbound queue, publishing everything that is pending.
    /// A failed publish puts the message back at the front and surfaces
    /// the error, which sends the client through a reconnect.
    async fn drain_outbound(
        &self,
        outbound: &OutboundQueue,
        routing: (&str, &str),
    ) -> Result<(), BrokerError> {
        let channel = self.channel.as_ref().expect("channel not set up");

        while let Some(msg) = outbound.pop() {
            debug!("{} - publishing message", self.profile.name);

            let routing_key = msg.routing_key.as_deref().unwrap_or(routing.1);

            let res = channel
                .basic_publish(
                    routing.0,
                    routing_key,
                    BasicPublishOptions::default(),
                    msg.payload.as_bytes(),
                    BasicProperties::default().with_expiration(msg.ttl_ms.into()),
                )
                .await;

            if let Err(e) = res {
                outbound.push_front(msg);
                return Err(BrokerError::Publish(e));
            }
        }

        Ok(())
    }

    /// Cooperative teardown: cancel the consumer, then close the channel.
    async fn stop(&mut self) {
        self.set_state(ChannelState::Cancelling);

        if let Some(channel) = &self.channel {
            if let Some(tag) = &self.consumer_tag {
                if let Err(e) = channel
                    .basic_cancel(tag, BasicCancelOptions::default())
                    .await
                {
                    debug!("{} - basic_cancel failed: {e}", self.profile.name);
                }
            }

            if let Err(e) = channel.close(0, "shutting down").await {
                debug!("{} - channel close failed: {e}", self.profile.name);
            }
        }

        self.channel = None;
        self.set_state(ChannelState::Closed);
    }
}

/// One broker connection plus its channels, wrapped in the reconnect
/// loop. `run()` returns only after a cooperative stop.
pub struct BrokerClient {
    url: String,
    channels: Vec<ChannelSetup>,
    cancel: CancellationToken,
}

impl BrokerClient {
    pub fn new(url: String, channels: Vec<ChannelSetup>, cancel: CancellationToken) -> Self {
        Self {
            url,
            channels,
            cancel,
        }
    }

    pub async fn run(&self) {
        let mut attempts: u64 = 0;

        loop {
            match self.run_connection().await {
                Ok(()) => {
                    info!("broker client stopped");
                    return;
                }
                Err(e) => {
                    warn!("broker connection lost, reconnect necessary: {e}");
                }
            }

            if self.cancel.is_cancelled() {
                return;
            }

            attempts += 1;
            let delay = std::time::Duration::from_secs(attempts.min(30));
            info!("reconnecting in {} seconds", delay.as_secs());

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connection lifetime: declare everything, then process
    /// deliveries and publish ticks until failure or stop.
    async fn run_connection(&self) -> Result<(), BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(BrokerError::Connection)?;

        info!("broker connection established");

        let mut drivers = Vec::with_capacity(self.channels.len());
        let mut consumers = Vec::new();
        let mut publishers = Vec::new();

        for (idx, setup) in self.channels.iter().enumerate() {
            let mut driver = ChannelDriver::new(setup.profile.clone());
            driver.setup(&connection).await?;

            match &setup.role {
                ChannelRole::Consume(handler) => {
                    let consumer = driver.start_consuming().await?;
                    consumers.push((idx, consumer, Arc::clone(handler)));
                }
                ChannelRole::Publish { outbound, routing } => {
                    driver.set_state(ChannelState::Publishing);
                    publishers.push((idx, outbound.clone(), *routing));
                }
            }

            drivers.push(driver);
        }

        let mut deliveries = futures::stream::select_all(
            consumers
                .iter()
                .map(|(idx, consumer, _)| consumer.clone().map(move |d| (*idx, d)))
                .collect::<Vec<_>>(),
        );

        let mut publish_timer = tokio::time::interval(PUBLISH_INTERVAL);
        publish_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    for driver in drivers.iter_mut() {
                        driver.stop().await;
                    }

                    if let Err(e) = connection.close(0, "shutting down").await {
                        debug!("connection close failed: {e}");
                    }

                    return Ok(());
                }

                _ = publish_timer.tick() => {
                    for (idx, outbound, routing) in &publishers {
                        drivers[*idx].drain_outbound(outbound, *routing).await?;
                    }
                }

                delivery = deliveries.next(), if !consumers.is_empty() => {
                    let Some((idx, delivery)) = delivery else {
                        return Err(BrokerError::Consumer(lapin::Error::InvalidChannelState(
                            lapin::ChannelState::Closed,
                        )));
                    };

                    let delivery = delivery.map_err(BrokerError::Consumer)?;

                    let handler = consumers
                        .iter()
                        .find(|(i, _, _)| i == &idx)
                        .map(|(_, _, h)| Arc::clone(h))
                        .expect("delivery from unknown consumer");

                    match handler.handle(&delivery.data).await {
                        MessageDisposition::Ack => {
                            delivery
                                .acker
                                .ack(BasicAckOptions::default())
                                .await
                                .map_err(BrokerError::Consumer)?;
                        }
                        MessageDisposition::NackRequeue => {
                            delivery
                                .acker
                                .nack(BasicNackOptions {
                                    requeue: true,
                                    ..BasicNackOptions::default()
                                })
                                .await
                                .map_err(BrokerError::Consumer)?;
                        }
                    }
                }
            }
        }
    }
}
