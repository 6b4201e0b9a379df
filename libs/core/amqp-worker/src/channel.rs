//! Channel binding
//!
//! One channel per handler binding: prefetch, exchange and queue declaration,
//! queue binding, and a consumer loop spawning one pipeline task per delivery.

use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::broker::{BrokerChannel, BrokerConnection, DeliveryStream, QueueOptions};
use crate::error::WorkerError;
use crate::event::EventBus;
use crate::handler::HandlerBinding;
use crate::pipeline::MessagePipeline;

/// Called when the broker drops a channel or connection the worker did not close
pub(crate) type LossHandler = Arc<dyn Fn() + Send + Sync>;

/// Worker-wide settings needed to bind a handler
#[derive(Debug, Clone)]
pub(crate) struct BindContext {
    pub worker_name: String,
    pub exchange_name: String,
    pub queue_name: String,
    pub dead_letter_exchange: Option<String>,
    pub prefetch: u16,
    pub task_timeout: Duration,
}

/// A channel consuming the queue of one handler binding
pub struct BoundChannel {
    routing_key: String,
    queue: String,
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    /// Set before a solicited cancel so the consumer loop does not report a loss
    cancelled: Arc<AtomicBool>,
    consumer_task: Mutex<Option<JoinHandle<()>>>,
}

impl BoundChannel {
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Stop new deliveries on this channel
    pub async fn cancel(&self) -> Result<(), WorkerError> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.channel.cancel(&self.consumer_tag).await
    }

    /// Wait up to `timeout` for the consumer loop and its in-flight messages.
    ///
    /// Returns `false` when the timeout expired first; the remaining tasks keep
    /// running and their late acks fail once the channel is closed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let handle = self
            .consumer_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        match handle {
            Some(handle) => tokio::time::timeout(timeout, handle).await.is_ok(),
            None => true,
        }
    }

    pub async fn close(&self) -> Result<(), WorkerError> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.channel.close().await?;
        info!(queue = %self.queue, "Channel closed");
        Ok(())
    }
}

impl std::fmt::Debug for BoundChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundChannel")
            .field("routing_key", &self.routing_key)
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}

/// Open and configure a channel for `binding` and start consuming its queue
pub(crate) async fn bind(
    connection: &dyn BrokerConnection,
    binding: &HandlerBinding,
    ctx: &BindContext,
    events: EventBus,
    on_lost: LossHandler,
) -> Result<BoundChannel, WorkerError> {
    let queue = binding.queue_name(&ctx.queue_name);
    let channel = connection.create_channel().await?;
    info!(
        exchange = %ctx.exchange_name,
        queue = %queue,
        prefetch = ctx.prefetch,
        "Channel created"
    );

    channel.prefetch(ctx.prefetch).await?;
    channel.assert_topic_exchange(&ctx.exchange_name).await?;
    let options = QueueOptions {
        dead_letter_exchange: ctx.dead_letter_exchange.clone(),
    };
    channel.assert_queue(&queue, &options).await?;
    channel
        .bind_queue(&queue, &ctx.exchange_name, binding.routing_key())
        .await?;

    let consumer_tag = format!("{}.{}.{}", ctx.worker_name, binding.routing_key(), Uuid::new_v4().simple());
    let consumer = channel.consume(&queue, &consumer_tag).await?;

    let pipeline = Arc::new(MessagePipeline::new(
        &ctx.worker_name,
        binding,
        channel.clone(),
        events,
        ctx.task_timeout,
        ctx.dead_letter_exchange.is_some(),
    ));
    let cancelled = Arc::new(AtomicBool::new(false));

    let span = info_span!("consumer", worker = %ctx.worker_name, queue = %queue);
    let consumer_task = tokio::spawn(
        consume_loop(consumer.deliveries, pipeline, cancelled.clone(), on_lost)
            .instrument(span)
            .with_current_subscriber(),
    );

    debug!(queue = %queue, consumer_tag = %consumer.tag, "Consumer started");

    Ok(BoundChannel {
        routing_key: binding.routing_key().to_string(),
        queue,
        consumer_tag: consumer.tag,
        channel,
        cancelled,
        consumer_task: Mutex::new(Some(consumer_task)),
    })
}

/// Spawn a pipeline task per delivery until the stream ends, then drain them.
async fn consume_loop(
    mut deliveries: DeliveryStream,
    pipeline: Arc<MessagePipeline>,
    cancelled: Arc<AtomicBool>,
    on_lost: LossHandler,
) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    let pipeline_task = pipeline.clone();
                    in_flight.spawn(
                        async move {
                            pipeline_task.process(delivery).await;
                        }
                        .in_current_span()
                        .with_current_subscriber(),
                    );
                    pipeline.metrics().in_flight(in_flight.len());
                }
                Some(Err(e)) => {
                    if cancelled.load(Ordering::SeqCst) {
                        debug!(error = %e, "Consumer stream failed after cancel");
                    } else {
                        error!(error = %e, "Channel error");
                        on_lost();
                    }
                    break;
                }
                None => {
                    if !cancelled.load(Ordering::SeqCst) {
                        warn!("Channel closed by the broker");
                        on_lost();
                    }
                    break;
                }
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Message task failed");
                }
                pipeline.metrics().in_flight(in_flight.len());
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Message task failed");
        }
    }
    pipeline.metrics().in_flight(0);
    debug!("Consumer drained");
}
