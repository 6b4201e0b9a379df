//! End-to-end tests against a real RabbitMQ started with testcontainers.
//!
//! Run with `cargo test -p amqp-worker -- --ignored` when Docker is available.

use amqp_worker::{
    DeliveryInfo, HandlerBinding, HandlerError, HandlerResult, MessageHandler, RetryPolicy, TASK_COMPLETED,
    TASK_FAILED, Worker, WorkerConfig, WorkerOptions, create_worker,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::assertions::{assert_eventually, assert_some};
use test_utils::{TestDataBuilder, TestRabbitMq};

const ROUTING_KEY: &str = "hello";

#[derive(Default)]
struct Recorder {
    fail: bool,
    calls: Mutex<Vec<(Value, bool)>>,
}

impl Recorder {
    fn calls(&self) -> Vec<(Value, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, content: Value, delivery: DeliveryInfo) -> HandlerResult {
        self.calls.lock().unwrap().push((content, delivery.redelivered));
        if self.fail {
            return Err(HandlerError::failed("always failing"));
        }
        Ok(true)
    }
}

fn options() -> WorkerOptions {
    WorkerOptions::new().with_exit_hook(|_| {})
}

fn start(rabbitmq: &TestRabbitMq, config: WorkerConfig, handler: Arc<Recorder>) -> Worker {
    let config = WorkerConfig {
        broker_url: rabbitmq.url().to_string(),
        ..config
    };
    let bindings = vec![HandlerBinding::from_arc(ROUTING_KEY, handler, RetryPolicy::RetryOnce)];
    create_worker(bindings, config, options()).unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_retry_once_drops_after_two_attempts() {
    let rabbitmq = TestRabbitMq::new().await;
    let names = TestDataBuilder::from_test_name("test_retry_once_drops_after_two_attempts");
    let exchange = names.exchange("main");
    let queue = names.queue("main");

    let handler = Arc::new(Recorder {
        fail: true,
        ..Default::default()
    });
    let worker = start(
        &rabbitmq,
        WorkerConfig::new("e2e-worker", "", &exchange, &queue),
        handler.clone(),
    );
    worker.listen().await.unwrap();

    let failed = worker.wait(TASK_FAILED, Duration::from_secs(5));
    rabbitmq
        .publish(&exchange, ROUTING_KEY, json!({"hello": "world"}).to_string().as_bytes())
        .await;
    failed.await.unwrap();

    assert_eq!(
        handler.calls(),
        vec![(json!({"hello": "world"}), false), (json!({"hello": "world"}), true)]
    );

    worker.close(false).await;
    let derived = format!("{}.{}", queue, ROUTING_KEY);
    assert_eq!(rabbitmq.message_count(&derived).await, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_dead_lettered_message_reaches_secondary_worker() {
    let rabbitmq = TestRabbitMq::new().await;
    let names = TestDataBuilder::from_test_name("test_dead_lettered_message_reaches_secondary_worker");
    let exchange = names.exchange("main");
    let secondary_exchange = names.exchange("secondary");

    let failing = Arc::new(Recorder {
        fail: true,
        ..Default::default()
    });
    let main = start(
        &rabbitmq,
        WorkerConfig::new("e2e-main", "", &exchange, names.queue("main"))
            .with_dead_letter_exchange(&secondary_exchange),
        failing.clone(),
    );
    let receiver = Arc::new(Recorder::default());
    let secondary = start(
        &rabbitmq,
        WorkerConfig::new("e2e-secondary", "", &secondary_exchange, names.queue("secondary")),
        receiver.clone(),
    );
    main.listen().await.unwrap();
    secondary.listen().await.unwrap();

    let consumed = secondary.wait(TASK_COMPLETED, Duration::from_secs(5));
    rabbitmq
        .publish(&exchange, ROUTING_KEY, json!({"hello": "world"}).to_string().as_bytes())
        .await;
    consumed.await.unwrap();

    assert_eq!(failing.calls().len(), 2);
    let (content, redelivered) = assert_some(receiver.calls().into_iter().next(), "secondary delivery");
    assert_eq!(content, json!({"hello": "world"}));
    assert!(!redelivered);

    main.close(false).await;
    secondary.close(false).await;

    let main_queue = format!("{}.{}", names.queue("main"), ROUTING_KEY);
    let secondary_queue = format!("{}.{}", names.queue("secondary"), ROUTING_KEY);
    let (rabbitmq, main_queue, secondary_queue) = (&rabbitmq, main_queue.as_str(), secondary_queue.as_str());
    assert_eventually(Duration::from_secs(2), "queues drained", move || async move {
        rabbitmq.message_count(main_queue).await == 0 && rabbitmq.message_count(secondary_queue).await == 0
    })
    .await;
}
