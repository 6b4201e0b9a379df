//! Events Worker Service
//!
//! A background worker consuming task lifecycle events from RabbitMQ.
//!
//! ## Architecture
//!
//! ```text
//! Topic exchange (AMQP_EXCHANGE)
//!   ↓ (routing key: task.events)
//! Queue <AMQP_QUEUE>.task.events
//!   ↓
//! amqp_worker::Worker
//!   ↓ (validate, handle, retry policy)
//! TaskEventHandler
//! ```
//!
//! ## Features
//!
//! - Typed, validated payloads; malformed events are dropped
//! - Retry policy selected with `WORKER_RETRY_POLICY`
//! - Optional dead-letter exchange for events that ran out of retries
//! - Graceful shutdown handling
//! - Health check endpoint for Kubernetes probes

pub mod handlers;

use amqp_worker::{
    HandlerBinding, HealthState, RetryPolicy, WORKER_CLOSED, Worker, WorkerConfig, WorkerOptions, create_worker,
    health_router, metrics, termination_signal,
};
use core_config::amqp::AmqpConfig;
use core_config::health::HealthServerConfig;
use core_config::worker::WorkerSettings;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{Dispatch, error, info};

use crate::handlers::{TASK_EVENTS_ROUTING_KEY, TaskEventHandler};

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, config: HealthServerConfig) -> Result<()> {
    let app = health_router(health_state);

    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Map environment settings onto worker options
pub fn worker_options(settings: &WorkerSettings) -> WorkerOptions {
    WorkerOptions::new()
        .with_heartbeat(settings.heartbeat)
        .with_task_timeout(settings.task_timeout)
        .with_process_exit_timeout(settings.process_exit_timeout)
        .with_channel_close_timeout(settings.channel_close_timeout)
        .with_channel_prefetch(settings.channel_prefetch)
        .with_close_on_signals(settings.close_on_signals)
}

/// Map the AMQP environment config onto the worker config
pub fn worker_config(amqp: AmqpConfig) -> WorkerConfig {
    let config = WorkerConfig::new(amqp.worker_name, amqp.url, amqp.exchange, amqp.queue);
    match amqp.dead_letter_exchange {
        Some(exchange) => config.with_dead_letter_exchange(exchange),
        None => config,
    }
}

/// Build the worker with its task event binding, logging through `logger`
pub fn build_worker(amqp: AmqpConfig, settings: &WorkerSettings, logger: Dispatch) -> Result<Worker> {
    let policy: RetryPolicy = settings
        .retry_policy
        .parse()
        .wrap_err("Invalid WORKER_RETRY_POLICY")?;

    let bindings = vec![HandlerBinding::new(TASK_EVENTS_ROUTING_KEY, TaskEventHandler::new(), policy)];
    let options = worker_options(settings).with_logger(logger);
    create_worker(bindings, worker_config(amqp), options).wrap_err("Invalid worker configuration")
}

/// Run the events worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads broker, worker and health server configuration
/// 3. Connects to RabbitMQ and starts consuming task events
/// 4. Serves health and metrics endpoints
/// 5. Closes the worker on SIGINT/SIGTERM
///
/// With `WORKER_CLOSE_ON_SIGNALS` the worker owns shutdown and this never
/// returns: the process ends through the worker's exit hook.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is missing or invalid
/// - The broker connection fails
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    let logger = core_config::tracing::init_tracing(&environment);

    metrics::init_metrics();

    let app_name = env!("CARGO_PKG_NAME");
    let app_version = env!("CARGO_PKG_VERSION");
    info!(name = %app_name, version = %app_version, "Starting events worker service");
    info!("Environment: {:?}", environment);

    let amqp = AmqpConfig::from_env().wrap_err("Failed to load AMQP configuration")?;
    let settings = WorkerSettings::from_env().wrap_err("Failed to load worker settings")?;
    let health_config = HealthServerConfig::from_env().wrap_err("Failed to load health server configuration")?;
    info!(
        worker = %amqp.worker_name,
        exchange = %amqp.exchange,
        queue = %amqp.queue,
        dead_letter_exchange = ?amqp.dead_letter_exchange,
        retry_policy = %settings.retry_policy,
        prefetch = settings.channel_prefetch,
        "Worker configuration loaded"
    );

    let worker = build_worker(amqp, &settings, logger)?;
    worker.listen().await.wrap_err("Failed to start worker")?;

    let health_state = HealthState::new(worker.clone(), app_name, app_version);
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_config).await {
            error!(error = %e, "Health server failed");
        }
    });

    if settings.close_on_signals {
        wait_for_exit(&worker).await;
    } else {
        tokio::select! {
            signal = termination_signal() => {
                match signal {
                    Ok(signal) => info!(signal, "Received termination signal, initiating shutdown..."),
                    Err(e) => error!(error = %e, "Error waiting for shutdown signal"),
                }
                worker.close(false).await;
            }
            _ = wait_for_exit(&worker) => {}
        }
    }

    info!("Events worker service stopped");
    Ok(())
}

/// Park until the process ends after the worker closed itself.
///
/// A forced close emits `worker.closed` and then runs the exit hook once
/// `process_exit_timeout` elapses; returning here would end the runtime
/// before that grace period is over.
async fn wait_for_exit(worker: &Worker) {
    let day = Duration::from_secs(24 * 60 * 60);
    while worker.wait(WORKER_CLOSED, day).await.is_err() {}
    info!("Worker closed, waiting for process exit");
    std::future::pending::<()>().await
}
