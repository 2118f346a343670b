//! ---
//! lw_section: "02-messaging-telemetry-bus"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Telemetry bus topics, wire payloads and in-process broker."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use prometheus::{IntCounter, Opts, Registry};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use lw_common::config::BusConfig;

use crate::chaos::{ChaosDecision, ChaosPolicy, ChaosState};
use crate::link::{LinkFault, LinkState};
use crate::topic::Topic;
use crate::{BusError, Result};

/// A published message as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusMessage {
    /// Unique identifier for tracing and deduplication.
    pub id: Uuid,
    /// Topic the message was published on.
    pub topic: Topic,
    /// Raw JSON payload; normalization happens at the consumer boundary.
    pub payload: JsonValue,
    /// Timestamp assigned at publish time.
    pub published_at: DateTime<Utc>,
}

impl BusMessage {
    fn new(topic: Topic, payload: JsonValue) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic,
            payload,
            published_at: Utc::now(),
        }
    }
}

/// Direction of message movement, for consistent activity logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Message entering the bus from a publisher.
    Outbound,
    /// Message handed to a subscriber.
    Inbound,
    /// Message lost: queue overflow, severed link or chaos.
    Dropped,
}

/// Emit a structured log entry for message activity.
pub fn log_activity(direction: MessageDirection, message: &BusMessage) {
    debug!(
        message_id = %message.id,
        topic = %message.topic,
        published_at = %message.published_at,
        direction = ?direction,
        "bus activity"
    );
}

/// Snapshot of bus delivery counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BusCounters {
    /// Messages accepted from publishers.
    pub published: u64,
    /// Per-subscriber successful deliveries.
    pub delivered: u64,
    /// Per-subscriber losses (overflow, severed link, chaos).
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BusCounters {
        BusCounters {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Prometheus handles for bus activity.
pub struct BusMetrics {
    published: IntCounter,
    delivered: IntCounter,
    dropped: IntCounter,
}

impl BusMetrics {
    /// Register bus metrics with the provided registry.
    pub fn register(registry: &Registry) -> std::result::Result<Self, prometheus::Error> {
        let published = IntCounter::with_opts(Opts::new(
            "bus_published_total",
            "Messages accepted from publishers",
        ))?;
        let delivered = IntCounter::with_opts(Opts::new(
            "bus_delivered_total",
            "Messages handed to subscribers",
        ))?;
        let dropped = IntCounter::with_opts(Opts::new(
            "bus_dropped_total",
            "Messages lost to overflow, severed links or chaos",
        ))?;

        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(delivered.clone()))?;
        registry.register(Box::new(dropped.clone()))?;

        Ok(Self {
            published,
            delivered,
            dropped,
        })
    }
}

struct Subscriber {
    client: String,
    link: Arc<LinkState>,
    sender: mpsc::Sender<BusMessage>,
}

struct BrokerInner {
    queue_depth: usize,
    reconnect_backoff: Duration,
    subscribers: Mutex<IndexMap<Topic, Vec<Subscriber>>>,
    counters: Counters,
    chaos: Mutex<Option<ChaosState>>,
    metrics: Mutex<Option<BusMetrics>>,
}

impl BrokerInner {
    fn note_published(&self) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = self.metrics.lock().as_ref() {
            metrics.published.inc();
        }
    }

    fn note_delivered(&self) {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = self.metrics.lock().as_ref() {
            metrics.delivered.inc();
        }
    }

    fn note_dropped(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = self.metrics.lock().as_ref() {
            metrics.dropped.inc();
        }
    }

    fn route(&self, message: BusMessage) {
        self.note_published();
        log_activity(MessageDirection::Outbound, &message);

        let copies = {
            let chaos = self.chaos.lock();
            match chaos.as_ref().map(|state| state.decide()) {
                Some(ChaosDecision::Drop) => {
                    self.note_dropped();
                    warn!(
                        target: "lw::bus::chaos",
                        message_id = %message.id,
                        topic = %message.topic,
                        "chaos dropped message"
                    );
                    log_activity(MessageDirection::Dropped, &message);
                    return;
                }
                Some(ChaosDecision::Duplicate) => {
                    warn!(
                        target: "lw::bus::chaos",
                        message_id = %message.id,
                        topic = %message.topic,
                        "chaos duplicated message"
                    );
                    2
                }
                Some(ChaosDecision::Deliver) | None => 1,
            }
        };

        let subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get(&message.topic) else {
            return;
        };
        for _ in 0..copies {
            for subscriber in list {
                if !subscriber.link.is_connected() {
                    self.note_dropped();
                    debug!(
                        client = %subscriber.client,
                        topic = %message.topic,
                        "delivery skipped; subscriber link severed"
                    );
                    continue;
                }
                match subscriber.sender.try_send(message.clone()) {
                    Ok(()) => self.note_delivered(),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.note_dropped();
                        warn!(
                            client = %subscriber.client,
                            topic = %message.topic,
                            "subscriber queue full; message dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        self.note_dropped();
                        debug!(client = %subscriber.client, "subscriber receiver gone");
                    }
                }
            }
        }
    }
}

/// Pure fan-out router. Owns no application semantics: it moves snapshots
/// between clients and counts what it could not move.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Create a broker with the configured subscriber queue depth.
    pub fn new(config: &BusConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queue_depth: config.queue_depth,
                reconnect_backoff: config.reconnect_backoff,
                subscribers: Mutex::new(IndexMap::new()),
                counters: Counters::default(),
                chaos: Mutex::new(None),
                metrics: Mutex::new(None),
            }),
        }
    }

    /// Create a named client with its own (initially connected) link.
    pub fn client(&self, name: impl Into<String>) -> BusClient {
        let name = name.into();
        BusClient {
            link: Arc::new(LinkState::new(name.clone())),
            name,
            inner: self.inner.clone(),
        }
    }

    /// Install a loss/duplication policy. Replaces any previous one.
    pub fn install_chaos(&self, policy: ChaosPolicy) {
        *self.inner.chaos.lock() = Some(ChaosState::new(policy));
    }

    /// Attach Prometheus counters; the internal counters keep running
    /// either way.
    pub fn attach_metrics(&self, metrics: BusMetrics) {
        *self.inner.metrics.lock() = Some(metrics);
    }

    /// Snapshot of delivery counters.
    pub fn counters(&self) -> BusCounters {
        self.inner.counters.snapshot()
    }
}

/// A named participant on the bus.
#[derive(Clone)]
pub struct BusClient {
    name: String,
    link: Arc<LinkState>,
    inner: Arc<BrokerInner>,
}

impl BusClient {
    /// Client name, used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fault-injection handle over this client's link.
    pub fn link_fault(&self) -> LinkFault {
        LinkFault::new(self.link.clone())
    }

    /// True while this client's link is up.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Block until the link is up, retrying on the broker's fixed
    /// reconnect backoff. Publishing resumes from "now"; anything sent
    /// while the link was down is gone.
    pub async fn ensure_connected(&self) {
        if self.link.is_connected() {
            return;
        }
        self.link
            .wait_connected(self.inner.reconnect_backoff)
            .await;
        debug!(client = %self.name, "reconnected to bus");
    }

    /// Serialize and publish a payload.
    pub fn publish<T: Serialize>(&self, topic: Topic, payload: &T) -> Result<Uuid> {
        self.publish_value(topic, serde_json::to_value(payload)?)
    }

    /// Publish a raw JSON payload.
    pub fn publish_value(&self, topic: Topic, payload: JsonValue) -> Result<Uuid> {
        if !self.link.is_connected() {
            return Err(BusError::Disconnected(self.name.clone()));
        }
        let message = BusMessage::new(topic, payload);
        let id = message.id;
        self.inner.route(message);
        Ok(id)
    }

    /// Subscribe to a topic with a bounded queue. Messages on this topic
    /// arrive in publish order; overflow drops the newest message for this
    /// subscriber only.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.inner.queue_depth);
        self.inner
            .subscribers
            .lock()
            .entry(topic)
            .or_default()
            .push(Subscriber {
                client: self.name.clone(),
                link: self.link.clone(),
                sender,
            });
        debug!(client = %self.name, topic = %topic, "subscribed");
        Subscription { topic, receiver }
    }
}

/// Receiving half of a subscription.
pub struct Subscription {
    topic: Topic,
    receiver: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    /// Topic this subscription is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait for the next message. `None` once the broker side is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        let message = self.receiver.recv().await;
        if let Some(message) = &message {
            log_activity(MessageDirection::Inbound, message);
        }
        message
    }

    /// Drain one message without waiting.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        match self.receiver.try_recv() {
            Ok(message) => {
                log_activity(MessageDirection::Inbound, &message);
                Some(message)
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lw_common::ChannelId;
    use serde_json::json;

    fn test_broker(queue_depth: usize) -> Broker {
        Broker::new(&BusConfig {
            queue_depth,
            reconnect_backoff: Duration::from_millis(5),
        })
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let broker = test_broker(8);
        let publisher = broker.client("meter");
        let mut first = broker.client("backend-a").subscribe(Topic::Mode);
        let mut second = broker.client("backend-b").subscribe(Topic::Mode);

        let id = publisher
            .publish_value(Topic::Mode, json!({ "mode": "manual" }))
            .unwrap();

        assert_eq!(first.recv().await.unwrap().id, id);
        assert_eq!(second.recv().await.unwrap().id, id);
        assert_eq!(broker.counters().delivered, 2);
    }

    #[tokio::test]
    async fn topic_order_is_publish_order() {
        let broker = test_broker(16);
        let publisher = broker.client("meter");
        let mut subscription = broker
            .client("backend")
            .subscribe(Topic::Telemetry(ChannelId::One));

        for sequence in 0..5 {
            publisher
                .publish_value(Topic::Telemetry(ChannelId::One), json!({ "seq": sequence }))
                .unwrap();
        }
        for sequence in 0..5 {
            let message = subscription.recv().await.unwrap();
            assert_eq!(message.payload["seq"], json!(sequence));
        }
    }

    #[tokio::test]
    async fn overflow_drops_for_that_subscriber_only() {
        let broker = test_broker(2);
        let publisher = broker.client("meter");
        let mut slow = broker.client("slow").subscribe(Topic::Audit);

        for sequence in 0..3 {
            publisher
                .publish_value(Topic::Audit, json!({ "seq": sequence }))
                .unwrap();
        }

        // depth 2: the third publish was dropped for this subscriber
        assert_eq!(slow.try_recv().unwrap().payload["seq"], json!(0));
        assert_eq!(slow.try_recv().unwrap().payload["seq"], json!(1));
        assert!(slow.try_recv().is_none());
        assert_eq!(broker.counters().dropped, 1);
        assert_eq!(broker.counters().delivered, 2);
    }

    #[tokio::test]
    async fn severed_publisher_cannot_publish() {
        let broker = test_broker(4);
        let publisher = broker.client("meter");
        let fault = publisher.link_fault();

        fault.sever();
        let err = publisher
            .publish_value(Topic::Mode, json!({ "mode": "auto" }))
            .unwrap_err();
        assert!(matches!(err, BusError::Disconnected(name) if name == "meter"));
        assert_eq!(broker.counters().published, 0);

        fault.restore();
        publisher
            .publish_value(Topic::Mode, json!({ "mode": "auto" }))
            .unwrap();
        assert_eq!(broker.counters().published, 1);
    }

    #[tokio::test]
    async fn severed_subscriber_misses_traffic_without_backlog() {
        let broker = test_broker(8);
        let publisher = broker.client("meter");
        let consumer = broker.client("backend");
        let mut subscription = consumer.subscribe(Topic::RelayStatus(ChannelId::One));
        let fault = consumer.link_fault();

        publisher
            .publish_value(Topic::RelayStatus(ChannelId::One), json!({ "relay_state": true }))
            .unwrap();
        assert!(subscription.recv().await.unwrap().payload["relay_state"] == json!(true));

        fault.sever();
        for _ in 0..3 {
            publisher
                .publish_value(Topic::RelayStatus(ChannelId::One), json!({ "relay_state": false }))
                .unwrap();
        }
        assert!(subscription.try_recv().is_none(), "no delivery during outage");

        fault.restore();
        assert!(
            subscription.try_recv().is_none(),
            "no backlog replay after heal"
        );

        publisher
            .publish_value(Topic::RelayStatus(ChannelId::One), json!({ "relay_state": false }))
            .unwrap();
        let fresh = subscription.recv().await.unwrap();
        assert_eq!(fresh.payload["relay_state"], json!(false));
    }

    #[tokio::test]
    async fn chaos_drop_loses_every_second_message() {
        let broker = test_broker(8);
        broker.install_chaos(ChaosPolicy {
            drop_every_nth: Some(2),
            duplicate_every_nth: None,
        });
        let publisher = broker.client("meter");
        let mut subscription = broker.client("backend").subscribe(Topic::Audit);

        for sequence in 0..4 {
            publisher
                .publish_value(Topic::Audit, json!({ "seq": sequence }))
                .unwrap();
        }
        assert_eq!(subscription.try_recv().unwrap().payload["seq"], json!(0));
        assert_eq!(subscription.try_recv().unwrap().payload["seq"], json!(2));
        assert!(subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn chaos_duplicate_delivers_twice() {
        let broker = test_broker(8);
        broker.install_chaos(ChaosPolicy {
            drop_every_nth: None,
            duplicate_every_nth: Some(1),
        });
        let publisher = broker.client("meter");
        let mut subscription = broker.client("backend").subscribe(Topic::Mode);

        let id = publisher
            .publish_value(Topic::Mode, json!({ "mode": "auto" }))
            .unwrap();
        assert_eq!(subscription.try_recv().unwrap().id, id);
        assert_eq!(subscription.try_recv().unwrap().id, id);
        assert!(subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn metrics_mirror_internal_counters() {
        let registry = Registry::new();
        let broker = test_broker(4);
        broker.attach_metrics(BusMetrics::register(&registry).unwrap());
        let publisher = broker.client("meter");
        let mut subscription = broker.client("backend").subscribe(Topic::Mode);

        publisher
            .publish_value(Topic::Mode, json!({ "mode": "auto" }))
            .unwrap();
        subscription.recv().await.unwrap();

        let families = registry.gather();
        let published = families
            .iter()
            .find(|family| family.get_name() == "bus_published_total")
            .unwrap();
        assert_eq!(published.get_metric()[0].get_counter().get_value(), 1.0);
    }
}
