//! Broker abstraction
//!
//! The worker talks to the broker only through these traits. The production
//! implementation lives in [`crate::amqp`]; an in-memory one is available in
//! `testing` for unit tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::WorkerError;

/// Metadata delivered alongside a message payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryInfo {
    /// Channel-scoped tag used for ack/nack
    pub delivery_tag: u64,
    /// Set by the broker when this delivery is a retry of a requeued message
    pub redelivered: bool,
    pub routing_key: String,
    pub exchange: String,
}

/// A message pushed by the broker to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub data: Vec<u8>,
    pub info: DeliveryInfo,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, WorkerError>>;

/// An active subscription on a queue
pub struct Consumer {
    pub tag: String,
    pub deliveries: DeliveryStream,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").field("tag", &self.tag).finish()
    }
}

/// Queue declaration arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Exchange receiving messages rejected without requeue
    pub dead_letter_exchange: Option<String>,
}

/// Asynchronous connection-level notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// The connection closed
    Closed,
    /// The connection failed; it is unusable afterwards
    Error(String),
    /// The broker stopped reading from this connection (resource alarm)
    Blocked(String),
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a connection to `url`
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, WorkerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, WorkerError>;

    /// Subscribe to connection signals
    fn signals(&self) -> broadcast::Receiver<ConnectionSignal>;

    async fn close(&self) -> Result<(), WorkerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Bound the number of unacknowledged deliveries on this channel
    async fn prefetch(&self, count: u16) -> Result<(), WorkerError>;

    /// Declare a durable topic exchange
    async fn assert_topic_exchange(&self, exchange: &str) -> Result<(), WorkerError>;

    /// Declare a durable queue
    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), WorkerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), WorkerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Consumer, WorkerError>;

    /// Stop deliveries for `consumer_tag`; the delivery stream then ends
    async fn cancel(&self, consumer_tag: &str) -> Result<(), WorkerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), WorkerError>;

    /// Reject a delivery; `requeue = false` lets the broker dead-letter it
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError>;

    async fn close(&self) -> Result<(), WorkerError>;
}
