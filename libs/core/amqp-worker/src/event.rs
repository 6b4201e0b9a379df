//! Lifecycle events and the event bus
//!
//! Events are dispatched on a spawned task rather than inline, so the code that
//! emits an event finishes its current step (usually the ack) before any waiter
//! wakes up. Waiters only see events emitted after they registered.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use tokio::sync::oneshot;

use crate::error::WorkerError;

/// Default timeout for [`EventBus::wait`]
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Events announced by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString, EnumIter)]
pub enum LifecycleEvent {
    /// A handler succeeded and the message was acknowledged
    #[strum(serialize = "task.completed")]
    TaskCompleted,
    /// A failed message was returned to the queue
    #[strum(serialize = "task.retried")]
    TaskRetried,
    /// A message was dropped (malformed, invalid, or out of retries)
    #[strum(serialize = "task.failed")]
    TaskFailed,
    /// The worker finished shutting down and is about to exit
    #[strum(serialize = "worker.closed")]
    WorkerClosed,
}

#[derive(Default)]
struct BusState {
    waiters: Vec<(LifecycleEvent, oneshot::Sender<()>)>,
    pending: VecDeque<LifecycleEvent>,
}

/// Publish/wait primitive shared by the pipeline, the shutdown coordinator and callers
#[derive(Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule delivery of `event` to the waiters registered so far.
    ///
    /// Outside a Tokio runtime the queue is flushed inline.
    pub fn emit(&self, event: LifecycleEvent) {
        self.lock().pending.push_back(event);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bus = self.clone();
                handle.spawn(async move { bus.flush() });
            }
            Err(_) => self.flush(),
        }
    }

    /// Deliver queued events in emission order.
    fn flush(&self) {
        let mut state = self.lock();
        while let Some(event) = state.pending.pop_front() {
            let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.waiters)
                .into_iter()
                .partition(|(wanted, _)| *wanted == event);
            state.waiters = rest;

            for (_, tx) in matching {
                // The receiver is gone when the wait already timed out.
                let _ = tx.send(());
            }
        }
    }

    /// Wait for the next occurrence of `event`.
    ///
    /// Registration happens when this method is called, not when the returned
    /// future is first polled, so an event emitted between the two is observed.
    pub fn wait(
        &self,
        event: LifecycleEvent,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<(), WorkerError>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            state.waiters.retain(|(_, tx)| !tx.is_closed());
            state.waiters.push((event, tx));
        }

        let timeout_ms = timeout.as_millis() as u64;
        Box::pin(async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) | Err(_) => Err(WorkerError::EventTimeout { event, timeout_ms }),
            }
        })
    }

    /// Number of waiters still registered
    pub fn waiter_count(&self) -> usize {
        self.lock().waiters.iter().filter(|(_, tx)| !tx.is_closed()).count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("waiters", &self.waiter_count())
            .finish()
    }
}
