//! Worker facade
//!
//! A [`Worker`] owns one broker connection with one channel per handler
//! binding. It is created once, started with [`Worker::listen`] and stopped
//! with [`Worker::close`]; callers observe progress through lifecycle events.

use futures::future::{BoxFuture, join_all};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, error, info};
use validator::Validate;

use crate::amqp::AmqpBroker;
use crate::broker::Broker;
use crate::channel::{self, BindContext, LossHandler};
use crate::config::{WorkerConfig, WorkerOptions, validate_bindings};
use crate::connection::ConnectionManager;
use crate::error::WorkerError;
use crate::event::{EventBus, LifecycleEvent};
use crate::handler::HandlerBinding;
use crate::shutdown::{ShutdownCoordinator, ShutdownPlan, ShutdownState, close_channel};

pub use crate::event::DEFAULT_WAIT_TIMEOUT;

pub const TASK_COMPLETED: LifecycleEvent = LifecycleEvent::TaskCompleted;
pub const TASK_RETRIED: LifecycleEvent = LifecycleEvent::TaskRetried;
pub const TASK_FAILED: LifecycleEvent = LifecycleEvent::TaskFailed;
pub const WORKER_CLOSED: LifecycleEvent = LifecycleEvent::WorkerClosed;

/// Create a worker connecting to a real AMQP broker
pub fn create_worker(
    handlers: Vec<HandlerBinding>,
    config: WorkerConfig,
    options: WorkerOptions,
) -> Result<Worker, WorkerError> {
    let broker = Arc::new(AmqpBroker::new(config.worker_name.clone()));
    Worker::with_broker(broker, handlers, config, options)
}

struct WorkerInner {
    config: WorkerConfig,
    options: WorkerOptions,
    bindings: Vec<HandlerBinding>,
    dispatch: Dispatch,
    events: EventBus,
    connections: ConnectionManager,
    shutdown: ShutdownCoordinator,
    listening: AtomicBool,
}

/// Handle to a worker; clones share the same worker
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Create a worker on any [`Broker`] implementation
    pub fn with_broker(
        broker: Arc<dyn Broker>,
        handlers: Vec<HandlerBinding>,
        config: WorkerConfig,
        options: WorkerOptions,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        options.validate()?;
        validate_bindings(&handlers)?;

        let dispatch = options.dispatch();
        Ok(Self {
            inner: Arc::new(WorkerInner {
                config,
                options,
                bindings: handlers,
                dispatch,
                events: EventBus::new(),
                connections: ConnectionManager::new(broker),
                shutdown: ShutdownCoordinator::new(),
                listening: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.worker_name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst) && self.inner.shutdown.is_running()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connections.is_connected()
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.inner.shutdown.state()
    }

    /// The bus lifecycle events are emitted on
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Connect, bind every handler and start consuming.
    ///
    /// A worker listens at most once. When the connection fails the worker
    /// stays unstarted and `listen` may be called again.
    pub async fn listen(&self) -> Result<(), WorkerError> {
        let dispatch = self.inner.dispatch.clone();
        self.start().with_subscriber(dispatch).await
    }

    async fn start(&self) -> Result<(), WorkerError> {
        let inner = &self.inner;
        if !inner.shutdown.is_running() {
            return Err(WorkerError::ShuttingDown(self.name().to_string()));
        }
        if inner.listening.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyListening(self.name().to_string()));
        }

        let on_lost = self.loss_handler();
        let connection = match inner
            .connections
            .connect(&inner.config.broker_url, inner.options.heartbeat, on_lost.clone())
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                inner.listening.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        if inner.options.close_on_signals {
            self.install_signal_listener();
        }

        let ctx = BindContext {
            worker_name: inner.config.worker_name.clone(),
            exchange_name: inner.config.exchange_name.clone(),
            queue_name: inner.config.queue_name.clone(),
            dead_letter_exchange: inner.config.dead_letter_exchange.clone(),
            prefetch: inner.options.channel_prefetch,
            task_timeout: inner.options.task_timeout,
        };

        // Each channel is tracked as soon as it is bound so a concurrent close sees it.
        let results = join_all(inner.bindings.iter().map(|binding| {
            let connection = connection.clone();
            let on_lost = on_lost.clone();
            let ctx = &ctx;
            async move {
                let bound = channel::bind(connection.as_ref(), binding, ctx, inner.events.clone(), on_lost).await?;
                if let Err(late) = inner.connections.track(bound) {
                    info!(queue = %late.queue(), "Worker closed while binding, closing channel");
                    close_channel(&late, inner.options.channel_close_timeout).await;
                    return Err(WorkerError::ShuttingDown(inner.config.worker_name.clone()));
                }
                Ok(())
            }
        }))
        .await;

        let mut failure = None;
        for result in results {
            if let Err(e) = result {
                if !matches!(e, WorkerError::ShuttingDown(_)) {
                    error!(error = %e, "Failed to bind handler");
                }
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            self.close(false).await;
            return Err(e);
        }

        let routing_keys: Vec<&str> = inner.bindings.iter().map(|b| b.routing_key()).collect();
        info!(
            worker = %self.name(),
            exchange = %inner.config.exchange_name,
            routing_keys = ?routing_keys,
            "Worker started"
        );
        Ok(())
    }

    /// Shut the worker down: stop consuming, drain, close channels and the
    /// connection. With `force_exit` the worker also emits `worker.closed`
    /// and ends the process after `process_exit_timeout`.
    ///
    /// Only the first call does anything; later calls return immediately.
    pub async fn close(&self, force_exit: bool) {
        let inner = &self.inner;
        let plan = ShutdownPlan {
            force_exit,
            channel_close_timeout: inner.options.channel_close_timeout,
            process_exit_timeout: inner.options.process_exit_timeout,
            exit_hook: inner.options.exit_hook.clone(),
        };
        inner
            .shutdown
            .shutdown(&inner.connections, &inner.events, plan)
            .with_subscriber(inner.dispatch.clone())
            .await;
    }

    /// Wait for the next `event`, failing after `timeout`.
    ///
    /// The wait is registered when this is called, before the future is polled.
    pub fn wait(&self, event: LifecycleEvent, timeout: Duration) -> BoxFuture<'static, Result<(), WorkerError>> {
        self.inner.events.wait(event, timeout)
    }

    /// Closes the worker with `force_exit` when the broker drops a resource
    fn loss_handler(&self) -> LossHandler {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move || spawn_forced_close(&weak))
    }

    fn install_signal_listener(&self) {
        let weak = Arc::downgrade(&self.inner);
        let signal = (self.inner.options.signal_source)();
        let listener = tokio::spawn(
            async move {
                match signal.await {
                    Ok(signal) => {
                        info!(signal, "Received termination signal");
                        // Closing aborts this task, so the close runs on its own.
                        spawn_forced_close(&weak);
                    }
                    Err(e) => error!(error = %e, "Failed to listen for termination signals"),
                }
            }
            .with_subscriber(self.inner.dispatch.clone()),
        );
        self.inner.shutdown.install_signal_listener(listener);
    }
}

fn spawn_forced_close(worker: &Weak<WorkerInner>) {
    let Some(inner) = worker.upgrade() else {
        return;
    };
    if !inner.shutdown.is_running() {
        return;
    }
    let worker = Worker { inner };
    tokio::spawn(async move { worker.close(true).await });
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name())
            .field("listening", &self.is_listening())
            .field("state", &self.shutdown_state())
            .finish_non_exhaustive()
    }
}
