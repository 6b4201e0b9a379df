//! Handler deadline enforcement
//!
//! The handler runs on its own task. When the deadline passes first, the
//! worker stops waiting for it but the task itself keeps running detached;
//! its eventual result is discarded.

use std::future::Future;
use std::time::Duration;
use tracing::Instrument;
use tracing::instrument::WithSubscriber;
use tracing::warn;

use crate::error::HandlerError;

/// Run `task` and race it against `timeout`.
///
/// Returns the task's own result when it settles in time, otherwise
/// [`HandlerError::Timeout`] tagged with `label`. A panic inside the task is
/// reported as [`HandlerError::Panicked`].
pub async fn run_with_deadline<F, T>(task: F, label: &str, timeout: Duration) -> Result<T, HandlerError>
where
    F: Future<Output = Result<T, HandlerError>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(task.in_current_span().with_current_subscriber());

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => Err(HandlerError::Panicked {
            label: label.to_string(),
        }),
        Ok(Err(join_err)) => Err(HandlerError::failed(format!(
            "Handler task in {} was cancelled: {}",
            label, join_err
        ))),
        Err(_) => {
            warn!(
                label = %label,
                timeout_ms = timeout.as_millis() as u64,
                "Handler exceeded its deadline, abandoning it"
            );
            Err(HandlerError::Timeout {
                label: label.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_times_out_slow_task() {
        let result: Result<(), _> = run_with_deadline(
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, HandlerError>(())
            },
            "test",
            Duration::from_millis(100),
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Handler timeout in test after 100ms");
    }

    #[tokio::test]
    async fn test_returns_success_in_time() {
        let result = run_with_deadline(
            async { Ok::<_, HandlerError>(true) },
            "test",
            Duration::from_millis(100),
        )
        .await;
        assert!(result.unwrap());
    }

    #[tokio::test]
    async fn test_returns_failure_verbatim() {
        let result: Result<bool, _> = run_with_deadline(
            async { Err::<bool, _>(HandlerError::failed("rejected")) },
            "test",
            Duration::from_millis(100),
        )
        .await;

        match result {
            Err(HandlerError::Failed { message, .. }) => assert_eq!(message, "rejected"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reports_panics() {
        let result: Result<bool, _> = run_with_deadline(
            async {
                if true {
                    panic!("handler blew up");
                }
                Ok::<_, HandlerError>(true)
            },
            "panicky",
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(result, Err(HandlerError::Panicked { label }) if label == "panicky"));
    }

    #[tokio::test]
    async fn test_abandoned_task_keeps_running() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let result: Result<(), _> = run_with_deadline(
            async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, HandlerError>(())
            },
            "slow",
            Duration::from_millis(10),
        )
        .await;
        assert!(result.is_err());
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
