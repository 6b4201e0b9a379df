//! Test support: an in-memory broker and a log-capturing subscriber
//!
//! `MemoryBroker` follows the broker semantics the worker depends on: topic
//! routing, per-channel prefetch, `redelivered` on requeue, requeue of
//! unacknowledged messages when a channel closes, and dead-lettering on
//! reject without requeue.

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, broadcast};
use tracing::field::{Field, Visit};
use tracing::{Dispatch, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use crate::broker::{
    Broker, BrokerChannel, BrokerConnection, Consumer, ConnectionSignal, Delivery, DeliveryInfo, QueueOptions,
};
use crate::error::WorkerError;

// ============================================================================
// Memory broker
// ============================================================================

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct ConsumerEntry {
    tag: String,
    channel_id: u64,
    tx: mpsc::UnboundedSender<Result<Delivery, WorkerError>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    dead_letter_exchange: Option<String>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, (String, StoredMessage)>,
    open: bool,
}

struct BindingRule {
    queue: String,
    exchange: String,
    pattern: String,
}

/// A delivery handed to a consumer, kept for assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub queue: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Default)]
struct BrokerState {
    fail_connect: Option<String>,
    connect_urls: Vec<String>,
    exchanges: Vec<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingRule>,
    channels: HashMap<u64, ChannelState>,
    signal_senders: HashMap<u64, broadcast::Sender<ConnectionSignal>>,
    next_id: u64,
    prefetch_calls: Vec<u16>,
    history: Vec<DeliveryRecord>,
    consume_gate: Option<Arc<Notify>>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&mut self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> usize {
        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        for queue in &targets {
            if let Some(state) = self.queues.get_mut(queue) {
                state.ready.push_back(StoredMessage {
                    payload: payload.clone(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
            }
        }
        targets.len()
    }

    /// Push ready messages to consumers with spare prefetch capacity.
    fn pump(&mut self) {
        let BrokerState {
            queues,
            channels,
            history,
            ..
        } = self;

        for (queue_name, queue) in queues.iter_mut() {
            while !queue.ready.is_empty() && !queue.consumers.is_empty() {
                let count = queue.consumers.len();
                let pick = (0..count)
                    .map(|offset| (queue.next_consumer + offset) % count)
                    .find(|&i| {
                        channels.get(&queue.consumers[i].channel_id).is_some_and(|c| {
                            c.open && (c.prefetch == 0 || c.unacked.len() < c.prefetch as usize)
                        })
                    });
                let Some(index) = pick else { break };
                queue.next_consumer = (index + 1) % count;

                let Some(message) = queue.ready.pop_front() else { break };
                let consumer = &queue.consumers[index];
                let Some(channel) = channels.get_mut(&consumer.channel_id) else { break };
                channel.next_tag += 1;
                let tag = channel.next_tag;

                let delivery = Delivery {
                    data: message.payload.clone(),
                    info: DeliveryInfo {
                        delivery_tag: tag,
                        redelivered: message.redelivered,
                        routing_key: message.routing_key.clone(),
                        exchange: message.exchange.clone(),
                    },
                };

                if consumer.tx.unbounded_send(Ok(delivery)).is_err() {
                    channel.next_tag -= 1;
                    queue.ready.push_front(message);
                    queue.consumers.remove(index);
                    queue.next_consumer = 0;
                    continue;
                }

                history.push(DeliveryRecord {
                    queue: queue_name.clone(),
                    payload: message.payload.clone(),
                    redelivered: message.redelivered,
                });
                channel.unacked.insert(tag, (queue_name.clone(), message));
            }
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.open = false;
            for (_, (queue, mut message)) in channel.unacked.drain() {
                message.redelivered = true;
                if let Some(state) = self.queues.get_mut(&queue) {
                    state.ready.push_front(message);
                }
            }
        }
        self.pump();
    }
}

/// AMQP `topic` pattern matching: `*` is one word, `#` is zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..])),
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// In-memory broker for tests
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker refusing every connection attempt
    pub fn refusing(reason: impl Into<String>) -> Self {
        let broker = Self::new();
        broker.lock().fail_connect = Some(reason.into());
        broker
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Declare a queue bound to `exchange` by `pattern`, e.g. to observe dead-lettered messages
    pub fn declare_binding(&self, queue: &str, exchange: &str, pattern: &str) {
        let mut state = self.lock();
        if !state.exchanges.iter().any(|e| e == exchange) {
            state.exchanges.push(exchange.to_string());
        }
        state.queues.entry(queue.to_string()).or_default();
        state.bindings.push(BindingRule {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        });
    }

    /// Publish to an exchange; returns the number of queues the message was routed to
    pub fn publish(&self, exchange: &str, routing_key: &str, payload: impl Into<Vec<u8>>) -> usize {
        let mut state = self.lock();
        let routed = state.route(exchange, routing_key, payload.into());
        state.pump();
        routed
    }

    pub fn publish_json(&self, exchange: &str, routing_key: &str, content: &serde_json::Value) -> usize {
        self.publish(exchange, routing_key, content.to_string())
    }

    /// Take the next ready message from a queue without a consumer
    pub fn get(&self, queue: &str) -> Option<Vec<u8>> {
        self.lock()
            .queues
            .get_mut(queue)
            .and_then(|q| q.ready.pop_front())
            .map(|m| m.payload)
    }

    /// Ready plus unacknowledged messages of a queue
    pub fn queue_depth(&self, queue: &str) -> usize {
        let state = self.lock();
        let ready = state.queues.get(queue).map_or(0, |q| q.ready.len());
        let unacked: usize = state
            .channels
            .values()
            .map(|c| c.unacked.values().filter(|(q, _)| q == queue).count())
            .sum();
        ready + unacked
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.lock().exchanges.iter().any(|e| e == exchange)
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, pattern: &str) -> bool {
        self.lock()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern)
    }

    pub fn dead_letter_exchange(&self, queue: &str) -> Option<String> {
        self.lock().queues.get(queue).and_then(|q| q.dead_letter_exchange.clone())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Every prefetch value set on any channel, in call order
    pub fn prefetch_calls(&self) -> Vec<u16> {
        self.lock().prefetch_calls.clone()
    }

    /// URLs passed to `connect`, in call order
    pub fn connect_urls(&self) -> Vec<String> {
        self.lock().connect_urls.clone()
    }

    /// Deliveries made to consumers of `queue`, in delivery order
    pub fn deliveries(&self, queue: &str) -> Vec<DeliveryRecord> {
        self.lock().history.iter().filter(|d| d.queue == queue).cloned().collect()
    }

    /// Hold every later `consume` call after the consumer is registered,
    /// until the returned gate is notified
    pub fn hold_consume(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().consume_gate = Some(gate.clone());
        gate
    }

    pub fn open_channel_count(&self) -> usize {
        self.lock().channels.values().filter(|c| c.open).count()
    }

    /// Deliver a signal to every open connection, as the broker would
    pub fn emit_signal(&self, signal: ConnectionSignal) {
        for tx in self.lock().signal_senders.values() {
            let _ = tx.send(signal.clone());
        }
    }

    /// Fail every active consumer stream, as a channel-level error would
    pub fn fail_consumers(&self, reason: &str) {
        let mut state = self.lock();
        for (name, queue) in state.queues.iter_mut() {
            for consumer in queue.consumers.drain(..) {
                let _ = consumer.tx.unbounded_send(Err(WorkerError::channel(name.clone(), reason)));
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, WorkerError> {
        let mut state = self.lock();
        state.connect_urls.push(url.to_string());
        if let Some(reason) = &state.fail_connect {
            return Err(WorkerError::connection(reason));
        }

        let id = state.next_id();
        let (tx, _) = broadcast::channel(16);
        state.signal_senders.insert(id, tx.clone());

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            signals: tx,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    signals: broadcast::Sender<ConnectionSignal>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, WorkerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::ConnectionClosed("connection is closed".into()));
        }
        let mut state = self.broker.lock();
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::new(),
                open: true,
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn signals(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.signals.subscribe()
    }

    async fn close(&self) -> Result<(), WorkerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::ConnectionClosed("connection already closed".into()));
        }
        let mut state = self.broker.lock();
        let owned: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == self.id && c.open)
            .map(|(id, _)| *id)
            .collect();
        for id in owned {
            state.close_channel(id);
        }
        state.signal_senders.remove(&self.id);
        let _ = self.signals.send(ConnectionSignal::Closed);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<(), WorkerError> {
        match state.channels.get(&self.id) {
            Some(channel) if channel.open => Ok(()),
            _ => Err(WorkerError::channel("-", "channel is closed")),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn prefetch(&self, count: u16) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        state.prefetch_calls.push(count);
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        Ok(())
    }

    async fn assert_topic_exchange(&self, exchange: &str) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        if !state.exchanges.iter().any(|e| e == exchange) {
            state.exchanges.push(exchange.to_string());
        }
        Ok(())
    }

    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        let entry = state.queues.entry(queue.to_string()).or_default();
        entry.dead_letter_exchange = options.dead_letter_exchange.clone();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        if !state.queues.contains_key(queue) {
            return Err(WorkerError::channel(queue, "no such queue"));
        }
        state.bindings.push(BindingRule {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: routing_key.to_string(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Consumer, WorkerError> {
        let (tx, rx) = mpsc::unbounded();
        let gate = {
            let mut state = self.broker.lock();
            self.ensure_open(&state)?;
            let Some(entry) = state.queues.get_mut(queue) else {
                return Err(WorkerError::channel(queue, "no such queue"));
            };
            entry.consumers.push(ConsumerEntry {
                tag: consumer_tag.to_string(),
                channel_id: self.id,
                tx,
            });
            state.pump();
            state.consume_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        Ok(Consumer {
            tag: consumer_tag.to_string(),
            deliveries: rx.boxed(),
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.tag != consumer_tag);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        let removed = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag));
        if removed.is_none() {
            return Err(WorkerError::channel("-", format!("unknown delivery tag {}", delivery_tag)));
        }
        state.pump();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        let Some((queue, mut message)) = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag))
        else {
            return Err(WorkerError::channel("-", format!("unknown delivery tag {}", delivery_tag)));
        };

        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_front(message);
            }
        } else {
            let dead_letter_exchange = state.queues.get(&queue).and_then(|q| q.dead_letter_exchange.clone());
            if let Some(dlx) = dead_letter_exchange {
                state.route(&dlx, &message.routing_key, message.payload);
            }
        }
        state.pump();
        Ok(())
    }

    async fn close(&self) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        state.close_channel(self.id);
        Ok(())
    }
}

// ============================================================================
// Log capture
// ============================================================================

/// A captured log event
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
    pub fields: HashMap<String, String>,
}

/// Tracing layer recording every event, for asserting on log output
#[derive(Clone, Default)]
pub struct CapturedLogs {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl CapturedLogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// A subscriber feeding this capture, usable as a worker logger
    pub fn dispatch(&self) -> Dispatch {
        Dispatch::new(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether an event at `level` contained `message`
    pub fn contains(&self, level: Level, message: &str) -> bool {
        self.count(level, message) > 0
    }

    pub fn count(&self, level: Level, message: &str) -> usize {
        self.records()
            .iter()
            .filter(|r| r.level == level && r.message.contains(message))
            .count()
    }
}

impl fmt::Debug for CapturedLogs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedLogs")
            .field("records", &self.records().len())
            .finish()
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: HashMap<String, String>,
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.insert(field.name().to_string(), format!("{:?}", value));
        }
    }
}

impl<S: Subscriber> Layer<S> for CapturedLogs {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(LogRecord {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("user.created", "user.created"));
        assert!(!topic_matches("user.created", "user.deleted"));
        assert!(topic_matches("user.*", "user.created"));
        assert!(!topic_matches("user.*", "user.created.v2"));
        assert!(topic_matches("user.#", "user.created.v2"));
        assert!(topic_matches("user.#", "user"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "order.created"));
    }

    #[tokio::test]
    async fn test_requeue_sets_redelivered() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("amqp://memory").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.assert_topic_exchange("ex").await.unwrap();
        channel.assert_queue("q", &QueueOptions::default()).await.unwrap();
        channel.bind_queue("q", "ex", "key").await.unwrap();
        let mut consumer = channel.consume("q", "tag").await.unwrap();

        assert_eq!(broker.publish("ex", "key", "{}"), 1);
        let first = consumer.deliveries.next().await.unwrap().unwrap();
        assert!(!first.info.redelivered);

        channel.nack(first.info.delivery_tag, true).await.unwrap();
        let second = consumer.deliveries.next().await.unwrap().unwrap();
        assert!(second.info.redelivered);

        channel.ack(second.info.delivery_tag).await.unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("amqp://memory").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.prefetch(1).await.unwrap();
        channel.assert_topic_exchange("ex").await.unwrap();
        channel.assert_queue("q", &QueueOptions::default()).await.unwrap();
        channel.bind_queue("q", "ex", "key").await.unwrap();
        let mut consumer = channel.consume("q", "tag").await.unwrap();

        broker.publish("ex", "key", "1");
        broker.publish("ex", "key", "2");
        let first = consumer.deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.deliveries("q").len(), 1);

        channel.ack(first.info.delivery_tag).await.unwrap();
        let second = consumer.deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.data, b"2");
    }

    #[tokio::test]
    async fn test_reject_without_requeue_dead_letters() {
        let broker = MemoryBroker::new();
        broker.declare_binding("dlq", "dlx", "#");
        let connection = broker.connect("amqp://memory").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.assert_topic_exchange("ex").await.unwrap();
        let options = QueueOptions {
            dead_letter_exchange: Some("dlx".into()),
        };
        channel.assert_queue("q", &options).await.unwrap();
        channel.bind_queue("q", "ex", "key").await.unwrap();
        let mut consumer = channel.consume("q", "tag").await.unwrap();

        broker.publish("ex", "key", "payload");
        let delivery = consumer.deliveries.next().await.unwrap().unwrap();
        channel.nack(delivery.info.delivery_tag, false).await.unwrap();

        assert_eq!(broker.get("dlq"), Some(b"payload".to_vec()));
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_closing_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("amqp://memory").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.assert_topic_exchange("ex").await.unwrap();
        channel.assert_queue("q", &QueueOptions::default()).await.unwrap();
        channel.bind_queue("q", "ex", "key").await.unwrap();
        let mut consumer = channel.consume("q", "tag").await.unwrap();

        broker.publish("ex", "key", "payload");
        consumer.deliveries.next().await.unwrap().unwrap();
        channel.close().await.unwrap();

        assert!(consumer.deliveries.next().await.is_none());
        assert_eq!(broker.queue_depth("q"), 1);
        assert!(channel.ack(1).await.is_err());
    }

    #[test]
    fn test_captured_logs() {
        let logs = CapturedLogs::new();
        tracing::dispatcher::with_default(&logs.dispatch(), || {
            tracing::warn!(reason = "memory", "Connection blocked");
        });
        assert!(logs.contains(Level::WARN, "Connection blocked"));
        assert_eq!(logs.records()[0].fields.get("reason").map(String::as_str), Some("memory"));
    }
}
