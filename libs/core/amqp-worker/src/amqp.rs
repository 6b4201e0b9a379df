//! RabbitMQ broker on top of `lapin`

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::broker::{
    Broker, BrokerChannel, BrokerConnection, Consumer, ConnectionSignal, Delivery, DeliveryInfo, QueueOptions,
};
use crate::error::WorkerError;

const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ with the given connection name
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    connection_name: String,
}

impl AmqpBroker {
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, WorkerError> {
        let connection = Connection::connect(
            url,
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into()),
        )
        .await
        .map_err(|e| WorkerError::connection(format!("RabbitMQ connection failed: {}", e)))?;

        let (signals, _) = broadcast::channel(16);
        let on_error = signals.clone();
        // lapin reports heartbeat loss and socket failures here; the connection is dead afterwards.
        connection.on_error(move |e| {
            let _ = on_error.send(ConnectionSignal::Error(e.to_string()));
        });

        Ok(Arc::new(AmqpConnection { connection, signals }))
    }
}

struct AmqpConnection {
    connection: Connection,
    signals: broadcast::Sender<ConnectionSignal>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, WorkerError> {
        if !self.connection.status().connected() {
            return Err(WorkerError::ConnectionClosed("connection is not open".into()));
        }
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| WorkerError::connection(format!("RabbitMQ channel creation failed: {}", e)))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn signals(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.signals.subscribe()
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| WorkerError::ConnectionClosed(e.to_string()))?;
        let _ = self.signals.send(ConnectionSignal::Closed);
        Ok(())
    }
}

struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    fn error(&self, cause: lapin::Error) -> WorkerError {
        WorkerError::channel(format!("channel {}", self.channel.id()), cause)
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn prefetch(&self, count: u16) -> Result<(), WorkerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| self.error(e))
    }

    async fn assert_topic_exchange(&self, exchange: &str) -> Result<(), WorkerError> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| WorkerError::channel(exchange, e))
    }

    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), WorkerError> {
        let mut args = FieldTable::default();
        if let Some(exchange) = &options.dead_letter_exchange {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.as_str().into()),
            );
        }

        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map(|_| ())
            .map_err(|e| WorkerError::channel(queue, e))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), WorkerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| WorkerError::channel(queue, e))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Consumer, WorkerError> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| WorkerError::channel(queue, e))?;

        let tag = consumer.tag().as_str().to_string();
        let queue = queue.to_string();
        let deliveries = consumer
            .map(move |item| match item {
                Ok(delivery) => Ok(Delivery {
                    info: DeliveryInfo {
                        delivery_tag: delivery.delivery_tag,
                        redelivered: delivery.redelivered,
                        routing_key: delivery.routing_key.as_str().to_string(),
                        exchange: delivery.exchange.as_str().to_string(),
                    },
                    data: delivery.data,
                }),
                Err(e) => Err(WorkerError::channel(queue.clone(), e)),
            })
            .boxed();

        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), WorkerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| self.error(e))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), WorkerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| self.error(e))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| self.error(e))
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| self.error(e))
    }
}
