//! Per-message processing
//!
//! decode → validate → handle under a deadline → retry policy → lifecycle
//! event → exactly one ack/nack on the channel.

use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, error, info_span, warn};

use crate::broker::{BrokerChannel, Delivery, DeliveryInfo};
use crate::deadline::run_with_deadline;
use crate::error::ValidationError;
use crate::event::{EventBus, LifecycleEvent};
use crate::handler::{HandlerBinding, MessageHandler};
use crate::metrics::WorkerMetrics;
use crate::retry::{Decision, RetryPolicy};

/// How a delivery was settled on the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledged and removed from the queue
    Ack,
    /// Rejected and returned to the queue
    Requeue,
    /// Rejected without requeue so the broker routes it to the dead-letter exchange
    DeadLetter,
}

/// Processes deliveries for one handler binding
pub struct MessagePipeline {
    worker_name: String,
    routing_key: String,
    /// Tag reported on handler timeouts
    label: String,
    handler: Arc<dyn MessageHandler>,
    policy: RetryPolicy,
    task_timeout: Duration,
    dead_letter: bool,
    channel: Arc<dyn BrokerChannel>,
    events: EventBus,
    metrics: WorkerMetrics,
}

impl MessagePipeline {
    /// Build the pipeline for `binding` on `channel`.
    ///
    /// `dead_letter` tells whether the binding's queue was declared with a
    /// dead-letter exchange; terminal failures are then rejected instead of acked.
    pub fn new(
        worker_name: &str,
        binding: &HandlerBinding,
        channel: Arc<dyn BrokerChannel>,
        events: EventBus,
        task_timeout: Duration,
        dead_letter: bool,
    ) -> Self {
        Self {
            worker_name: worker_name.to_string(),
            routing_key: binding.routing_key().to_string(),
            label: format!("{}:{}", worker_name, binding.routing_key()),
            handler: binding.handler().clone(),
            policy: binding.policy(),
            task_timeout,
            dead_letter,
            channel,
            events,
            metrics: WorkerMetrics::new(worker_name, binding.routing_key()),
        }
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Process one delivery and settle it on the channel
    pub async fn process(&self, delivery: Delivery) -> Disposition {
        let span = info_span!(
            "message",
            worker = %self.worker_name,
            routing_key = %self.routing_key,
            delivery_tag = delivery.info.delivery_tag,
            redelivered = delivery.info.redelivered,
        );
        self.run(delivery).instrument(span).await
    }

    async fn run(&self, delivery: Delivery) -> Disposition {
        let Delivery { data, info } = delivery;
        debug!(size = data.len(), "Received message");
        self.metrics.message_received(info.redelivered);

        let content: Value = match serde_json::from_slice(&data) {
            Ok(content) => content,
            Err(e) => {
                warn!(error = %e, "Content is not a valid JSON");
                self.metrics.task_failed("decode");
                return self.settle(&info, Disposition::Ack, LifecycleEvent::TaskFailed).await;
            }
        };

        let validated = panic::catch_unwind(AssertUnwindSafe(|| self.handler.validate(&content)))
            .unwrap_or_else(|_| Err(ValidationError::new("validator panicked")));
        let content = match validated {
            Ok(Some(validated)) => validated,
            Ok(None) => content,
            Err(e) => {
                warn!(error = %e, content = %content, "Message validation failed");
                self.metrics.task_failed("validation");
                return self.settle(&info, Disposition::Ack, LifecycleEvent::TaskFailed).await;
            }
        };

        let started = Instant::now();
        let handler = self.handler.clone();
        let handler_info = info.clone();
        let outcome = run_with_deadline(
            async move { handler.handle(content, handler_info).await },
            &self.label,
            self.task_timeout,
        )
        .await;

        let decision = self.policy.decide(&outcome, &info).await;

        let (disposition, event) = match (decision, &outcome) {
            (Decision::Requeue, _) => {
                self.metrics.task_retried();
                (Disposition::Requeue, LifecycleEvent::TaskRetried)
            }
            (Decision::Ack, Err(e)) => {
                self.metrics.task_failed(e.kind());
                let disposition = if self.dead_letter {
                    Disposition::DeadLetter
                } else {
                    Disposition::Ack
                };
                (disposition, LifecycleEvent::TaskFailed)
            }
            (Decision::Ack, Ok(_)) => {
                self.metrics.task_completed(started.elapsed());
                (Disposition::Ack, LifecycleEvent::TaskCompleted)
            }
        };

        self.settle(&info, disposition, event).await
    }

    /// Emit the lifecycle event and make the single channel call for this delivery.
    async fn settle(&self, info: &DeliveryInfo, disposition: Disposition, event: LifecycleEvent) -> Disposition {
        self.events.emit(event);

        let result = match disposition {
            Disposition::Ack => self.channel.ack(info.delivery_tag).await,
            Disposition::Requeue => self.channel.nack(info.delivery_tag, true).await,
            Disposition::DeadLetter => self.channel.nack(info.delivery_tag, false).await,
        };

        match result {
            Ok(()) => debug!(?disposition, event = %event, "Message settled"),
            Err(e) => error!(error = %e, ?disposition, "Failed to settle message on the channel"),
        }
        disposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Consumer, QueueOptions};
    use crate::error::{HandlerError, WorkerError};
    use crate::handler::HandlerResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Ack(u64),
        Nack(u64, bool),
    }

    #[derive(Default)]
    struct RecordingChannel {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingChannel {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerChannel for RecordingChannel {
        async fn prefetch(&self, _count: u16) -> Result<(), WorkerError> {
            Ok(())
        }
        async fn assert_topic_exchange(&self, _exchange: &str) -> Result<(), WorkerError> {
            Ok(())
        }
        async fn assert_queue(&self, _queue: &str, _options: &QueueOptions) -> Result<(), WorkerError> {
            Ok(())
        }
        async fn bind_queue(&self, _queue: &str, _exchange: &str, _routing_key: &str) -> Result<(), WorkerError> {
            Ok(())
        }
        async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<Consumer, WorkerError> {
            Err(WorkerError::channel(queue, "not supported"))
        }
        async fn cancel(&self, _consumer_tag: &str) -> Result<(), WorkerError> {
            Ok(())
        }
        async fn ack(&self, delivery_tag: u64) -> Result<(), WorkerError> {
            self.calls.lock().unwrap().push(Call::Ack(delivery_tag));
            Ok(())
        }
        async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError> {
            self.calls.lock().unwrap().push(Call::Nack(delivery_tag, requeue));
            Ok(())
        }
        async fn close(&self) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    /// Records payloads, fails the first `failures` calls
    struct ScriptedHandler {
        failures: usize,
        calls: AtomicUsize,
        seen: Mutex<Vec<Value>>,
        result: bool,
        delay: Duration,
        validator: fn(&Value) -> Result<Option<Value>, ValidationError>,
    }

    impl ScriptedHandler {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                result: true,
                delay: Duration::ZERO,
                validator: |_| Ok(None),
            }
        }
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        fn validate(&self, content: &Value) -> Result<Option<Value>, ValidationError> {
            (self.validator)(content)
        }

        async fn handle(&self, content: Value, _delivery: DeliveryInfo) -> HandlerResult {
            self.seen.lock().unwrap().push(content);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if call < self.failures {
                return Err(HandlerError::failed("scripted failure"));
            }
            Ok(self.result)
        }
    }

    fn pipeline(
        handler: Arc<ScriptedHandler>,
        policy: RetryPolicy,
        dead_letter: bool,
    ) -> (MessagePipeline, Arc<RecordingChannel>, EventBus) {
        let channel = Arc::new(RecordingChannel::default());
        let events = EventBus::new();
        let binding = HandlerBinding::from_arc("key", handler, policy);
        let pipeline = MessagePipeline::new(
            "test-worker",
            &binding,
            channel.clone(),
            events.clone(),
            Duration::from_millis(100),
            dead_letter,
        );
        (pipeline, channel, events)
    }

    fn delivery(tag: u64, redelivered: bool, data: &[u8]) -> Delivery {
        Delivery {
            data: data.to_vec(),
            info: DeliveryInfo {
                delivery_tag: tag,
                redelivered,
                routing_key: "key".to_string(),
                exchange: "exchange".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_is_acked_and_fails() {
        let handler = Arc::new(ScriptedHandler::new(0));
        let (pipeline, channel, events) = pipeline(handler.clone(), RetryPolicy::Infinite, false);

        let failed = events.wait(LifecycleEvent::TaskFailed, Duration::from_millis(200));
        let disposition = pipeline.process(delivery(7, false, b"{not json")).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(channel.calls(), vec![Call::Ack(7)]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        failed.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_payload_is_malformed() {
        let handler = Arc::new(ScriptedHandler::new(0));
        let (pipeline, channel, _events) = pipeline(handler, RetryPolicy::Infinite, true);

        assert_eq!(pipeline.process(delivery(1, false, b"")).await, Disposition::Ack);
        assert_eq!(channel.calls(), vec![Call::Ack(1)]);
    }

    #[tokio::test]
    async fn test_validation_failure_is_acked_and_fails() {
        let mut handler = ScriptedHandler::new(0);
        handler.validator = |_| Err(ValidationError::new("missing field"));
        let handler = Arc::new(handler);
        let (pipeline, channel, events) = pipeline(handler.clone(), RetryPolicy::Infinite, false);

        let failed = events.wait(LifecycleEvent::TaskFailed, Duration::from_millis(200));
        let disposition = pipeline.process(delivery(3, false, br#"{"hello":"world"}"#)).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(channel.calls(), vec![Call::Ack(3)]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        failed.await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_validator_is_acked_and_fails() {
        let mut handler = ScriptedHandler::new(0);
        handler.validator = |content| {
            let items = content["items"].as_array().unwrap();
            Ok(Some(Value::from(items.len())))
        };
        let handler = Arc::new(handler);
        let (pipeline, channel, events) = pipeline(handler.clone(), RetryPolicy::Infinite, true);

        let failed = events.wait(LifecycleEvent::TaskFailed, Duration::from_millis(200));
        let disposition = pipeline.process(delivery(8, false, br#"{"no_items":true}"#)).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(channel.calls(), vec![Call::Ack(8)]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        failed.await.unwrap();
    }

    #[tokio::test]
    async fn test_validator_output_replaces_payload() {
        let mut handler = ScriptedHandler::new(0);
        handler.validator = |_| Ok(Some(json!({"normalized": true})));
        let handler = Arc::new(handler);
        let (pipeline, _channel, _events) = pipeline(handler.clone(), RetryPolicy::NoRetry, false);

        pipeline.process(delivery(1, false, br#"{"raw":1}"#)).await;
        assert_eq!(*handler.seen.lock().unwrap(), vec![json!({"normalized": true})]);
    }

    #[tokio::test]
    async fn test_decoded_payload_passes_through_without_validator_output() {
        let handler = Arc::new(ScriptedHandler::new(0));
        let (pipeline, _channel, _events) = pipeline(handler.clone(), RetryPolicy::NoRetry, false);

        pipeline.process(delivery(1, false, br#"{"hello":"world"}"#)).await;
        assert_eq!(*handler.seen.lock().unwrap(), vec![json!({"hello": "world"})]);
    }

    #[tokio::test]
    async fn test_success_acks_and_completes() {
        let handler = Arc::new(ScriptedHandler::new(0));
        let (pipeline, channel, events) = pipeline(handler, RetryPolicy::RetryOnce, false);

        let completed = events.wait(LifecycleEvent::TaskCompleted, Duration::from_millis(200));
        assert_eq!(pipeline.process(delivery(9, false, b"{}")).await, Disposition::Ack);
        assert_eq!(channel.calls(), vec![Call::Ack(9)]);
        completed.await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_once_requeues_then_drops() {
        let handler = Arc::new(ScriptedHandler::new(usize::MAX));
        let (pipeline, channel, events) = pipeline(handler.clone(), RetryPolicy::RetryOnce, false);

        let retried = events.wait(LifecycleEvent::TaskRetried, Duration::from_millis(200));
        assert_eq!(pipeline.process(delivery(1, false, b"{}")).await, Disposition::Requeue);
        retried.await.unwrap();

        let failed = events.wait(LifecycleEvent::TaskFailed, Duration::from_millis(200));
        assert_eq!(pipeline.process(delivery(2, true, b"{}")).await, Disposition::Ack);
        failed.await.unwrap();

        assert_eq!(channel.calls(), vec![Call::Nack(1, true), Call::Ack(2)]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_dead_lettered_when_configured() {
        let handler = Arc::new(ScriptedHandler::new(usize::MAX));
        let (pipeline, channel, _events) = pipeline(handler, RetryPolicy::NoRetry, true);

        assert_eq!(pipeline.process(delivery(4, false, b"{}")).await, Disposition::DeadLetter);
        assert_eq!(channel.calls(), vec![Call::Nack(4, false)]);
    }

    #[tokio::test]
    async fn test_handler_timeout_goes_through_policy() {
        let mut handler = ScriptedHandler::new(0);
        handler.delay = Duration::from_millis(500);
        let handler = Arc::new(handler);
        let (pipeline, channel, events) = pipeline(handler, RetryPolicy::NoRetry, false);

        let failed = events.wait(LifecycleEvent::TaskFailed, Duration::from_millis(400));
        assert_eq!(pipeline.process(delivery(5, false, b"{}")).await, Disposition::Ack);
        assert_eq!(channel.calls(), vec![Call::Ack(5)]);
        failed.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_result_false_requeues() {
        let mut handler = ScriptedHandler::new(0);
        handler.result = false;
        let handler = Arc::new(handler);
        let (pipeline, channel, _events) = pipeline(handler, RetryPolicy::HandlerResult, false);

        assert_eq!(pipeline.process(delivery(6, true, b"{}")).await, Disposition::Requeue);
        assert_eq!(channel.calls(), vec![Call::Nack(6, true)]);
    }
}
