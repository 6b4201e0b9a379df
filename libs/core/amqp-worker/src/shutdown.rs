//! Graceful shutdown
//!
//! Shutdown runs at most once per worker and moves through
//! `Running -> Draining -> ChannelsClosed -> ConnectionClosed -> Terminated`.
//! Each channel is cancelled, drained for at most `channel_close_timeout`
//! and closed; then the connection closes. A forced shutdown also emits
//! `worker.closed` and ends the process after `process_exit_timeout`.

use futures::future::{BoxFuture, join_all};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::BoundChannel;
use crate::connection::ConnectionManager;
use crate::event::{EventBus, LifecycleEvent};

/// Terminates the process with the given status
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// The default exit hook: `std::process::exit`
pub fn process_exit() -> ExitHook {
    Arc::new(|code| std::process::exit(code))
}

/// Resolves with the name of the first termination signal received
pub type SignalSource = Arc<dyn Fn() -> BoxFuture<'static, io::Result<&'static str>> + Send + Sync>;

/// The default signal source: SIGINT and SIGTERM via [`termination_signal`]
pub fn os_signals() -> SignalSource {
    Arc::new(|| -> BoxFuture<'static, io::Result<&'static str>> { Box::pin(termination_signal()) })
}

/// Where a worker is in its shutdown sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    Draining = 1,
    ChannelsClosed = 2,
    ConnectionClosed = 3,
    Terminated = 4,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            2 => Self::ChannelsClosed,
            3 => Self::ConnectionClosed,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::ChannelsClosed => "channels_closed",
            Self::ConnectionClosed => "connection_closed",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Timings used by the shutdown sequence
#[derive(Clone)]
pub(crate) struct ShutdownPlan {
    pub force_exit: bool,
    pub channel_close_timeout: Duration,
    pub process_exit_timeout: Duration,
    pub exit_hook: ExitHook,
}

/// Runs the shutdown sequence exactly once
#[derive(Default)]
pub struct ShutdownCoordinator {
    state: AtomicU8,
    signal_listener: Mutex<Option<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Keep the task forwarding OS signals so it can be stopped on close
    pub(crate) fn install_signal_listener(&self, handle: JoinHandle<()>) {
        let previous = self
            .signal_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Whether a signal listener is installed and still waiting
    pub fn has_signal_listener(&self) -> bool {
        self.signal_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|listener| !listener.is_finished())
    }

    fn advance(&self, next: ShutdownState) {
        self.state.store(next as u8, Ordering::SeqCst);
        debug!(state = %next, "Shutdown state changed");
    }

    /// Run the shutdown sequence.
    ///
    /// Returns `false` without doing anything when a shutdown already started.
    pub(crate) async fn shutdown(&self, connections: &ConnectionManager, events: &EventBus, plan: ShutdownPlan) -> bool {
        let started = self
            .state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !started {
            debug!(state = %self.state(), "Shutdown already in progress");
            return false;
        }

        info!(force_exit = plan.force_exit, "Closing worker");

        let listener = self
            .signal_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }

        if connections.connection_lost() {
            warn!("Connection already lost, skipping channel shutdown");
        } else {
            let channels = connections.seal();
            join_all(
                channels
                    .iter()
                    .map(|channel| close_channel(channel, plan.channel_close_timeout)),
            )
            .await;
        }
        self.advance(ShutdownState::ChannelsClosed);

        match connections.close().await {
            Ok(()) => info!("Connection closed by the worker"),
            Err(e) => error!(error = %e, "Failed to close connection"),
        }
        self.advance(ShutdownState::ConnectionClosed);

        if plan.force_exit {
            events.emit(LifecycleEvent::WorkerClosed);
            info!(
                exit_timeout_ms = plan.process_exit_timeout.as_millis() as u64,
                "Worker closed, exiting process"
            );
            tokio::time::sleep(plan.process_exit_timeout).await;
            self.advance(ShutdownState::Terminated);
            (plan.exit_hook)(0);
        } else {
            self.advance(ShutdownState::Terminated);
            info!("Worker closed");
        }
        true
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Cancel, drain and close one channel, logging instead of failing
pub(crate) async fn close_channel(channel: &BoundChannel, drain_timeout: Duration) {
    if let Err(e) = channel.cancel().await {
        warn!(queue = %channel.queue(), error = %e, "Failed to cancel consumer");
    }

    if !channel.drain(drain_timeout).await {
        warn!(
            queue = %channel.queue(),
            timeout_ms = drain_timeout.as_millis() as u64,
            "In-flight messages still running at channel close"
        );
    }

    if let Err(e) = channel.close().await {
        error!(queue = %channel.queue(), error = %e, "Failed to close channel");
    }
}

/// Wait for SIGINT or SIGTERM and return the signal name
pub async fn termination_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result.map(|()| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map(|()| "SIGINT")
    }
}
