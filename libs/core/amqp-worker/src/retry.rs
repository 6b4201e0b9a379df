//! Retry policies
//!
//! A policy turns a handler outcome into an acknowledgment decision. Attempts
//! are never counted locally: the only signal is the broker's `redelivered`
//! flag, so `retry_once` caps at two attempts even across restarts while
//! `infinite` cannot tell attempt 2 from attempt 20.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, warn};

use crate::broker::DeliveryInfo;
use crate::error::{HandlerError, WorkerError};

/// What to do with a delivery once the handler settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Remove the message from the queue
    Ack,
    /// Return the message to the queue for redelivery
    Requeue,
}

impl Decision {
    pub fn is_ack(self) -> bool {
        matches!(self, Decision::Ack)
    }
}

/// Per-binding retry strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Requeue every failure, forever
    Infinite,
    /// Requeue every failure after pausing this channel's decision for the delay
    InfiniteWithSleep(Duration),
    /// Drop on the first failure
    NoRetry,
    /// Requeue the first failure, drop the second
    #[default]
    RetryOnce,
    /// Ack only when the handler returned `true`; requeue on `false` or error
    HandlerResult,
}

impl RetryPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            RetryPolicy::Infinite => "infinite",
            RetryPolicy::InfiniteWithSleep(_) => "infinite_with_sleep",
            RetryPolicy::NoRetry => "no_retry",
            RetryPolicy::RetryOnce => "retry_once",
            RetryPolicy::HandlerResult => "handler_result",
        }
    }

    /// Decide the disposition of a delivery.
    ///
    /// Logging is the only side effect, plus the pause of `InfiniteWithSleep`
    /// which delays this decision and nothing else.
    pub async fn decide(&self, outcome: &Result<bool, HandlerError>, delivery: &DeliveryInfo) -> Decision {
        let err = match (self, outcome) {
            (RetryPolicy::HandlerResult, Ok(true)) => return Decision::Ack,
            (RetryPolicy::HandlerResult, Ok(false)) => return Decision::Requeue,
            (_, Ok(_)) => return Decision::Ack,
            (_, Err(err)) => err,
        };

        match self {
            RetryPolicy::Infinite => {
                error!(error = %err, delivery_tag = delivery.delivery_tag, "Error handling message, retrying");
                Decision::Requeue
            }
            RetryPolicy::InfiniteWithSleep(delay) => {
                error!(
                    error = %err,
                    delivery_tag = delivery.delivery_tag,
                    sleep_ms = delay.as_millis() as u64,
                    "Error handling message, retrying after sleep"
                );
                tokio::time::sleep(*delay).await;
                Decision::Requeue
            }
            RetryPolicy::NoRetry => {
                error!(error = %err, delivery_tag = delivery.delivery_tag, "Error handling message, dropping");
                Decision::Ack
            }
            RetryPolicy::RetryOnce if !delivery.redelivered => {
                warn!(
                    error = %err,
                    delivery_tag = delivery.delivery_tag,
                    "Message handler failed to process message #1 - retrying one time"
                );
                Decision::Requeue
            }
            RetryPolicy::RetryOnce => {
                error!(
                    error = %err,
                    delivery_tag = delivery.delivery_tag,
                    "Message handler failed to process message #2 - discarding message"
                );
                Decision::Ack
            }
            RetryPolicy::HandlerResult => {
                error!(error = %err, delivery_tag = delivery.delivery_tag, "Error handling message, retrying");
                Decision::Requeue
            }
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::InfiniteWithSleep(delay) => write!(f, "{}:{}", self.name(), delay.as_millis()),
            _ => f.write_str(self.name()),
        }
    }
}

impl FromStr for RetryPolicy {
    type Err = WorkerError;

    /// Parse `infinite`, `no_retry`, `retry_once`, `handler_result` or
    /// `infinite_with_sleep:<millis>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let (name, arg) = match normalized.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (normalized.as_str(), None),
        };

        match (name, arg) {
            ("infinite", None) => Ok(RetryPolicy::Infinite),
            ("no_retry", None) => Ok(RetryPolicy::NoRetry),
            ("retry_once", None) => Ok(RetryPolicy::RetryOnce),
            ("handler_result", None) => Ok(RetryPolicy::HandlerResult),
            ("infinite_with_sleep", Some(ms)) => ms
                .parse::<u64>()
                .map(|ms| RetryPolicy::InfiniteWithSleep(Duration::from_millis(ms)))
                .map_err(|e| WorkerError::config(format!("Invalid sleep for retry policy '{}': {}", s, e))),
            _ => Err(WorkerError::config(format!("Unknown retry policy '{}'", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(redelivered: bool) -> DeliveryInfo {
        DeliveryInfo {
            delivery_tag: 1,
            redelivered,
            routing_key: "key".to_string(),
            exchange: "exchange".to_string(),
        }
    }

    fn failure() -> Result<bool, HandlerError> {
        Err(HandlerError::failed("some error"))
    }

    #[tokio::test]
    async fn test_success_is_acked_by_every_policy() {
        let policies = [
            RetryPolicy::Infinite,
            RetryPolicy::InfiniteWithSleep(Duration::from_millis(100)),
            RetryPolicy::NoRetry,
            RetryPolicy::RetryOnce,
            RetryPolicy::HandlerResult,
        ];
        for policy in policies {
            assert_eq!(policy.decide(&Ok(true), &delivery(false)).await, Decision::Ack, "{}", policy);
        }
    }

    #[tokio::test]
    async fn test_handler_result_uses_returned_boolean() {
        let policy = RetryPolicy::HandlerResult;
        assert_eq!(policy.decide(&Ok(false), &delivery(false)).await, Decision::Requeue);
        assert_eq!(policy.decide(&Ok(false), &delivery(true)).await, Decision::Requeue);
        assert_eq!(policy.decide(&failure(), &delivery(true)).await, Decision::Requeue);
    }

    #[tokio::test]
    async fn test_other_policies_ignore_returned_boolean() {
        assert_eq!(RetryPolicy::NoRetry.decide(&Ok(false), &delivery(false)).await, Decision::Ack);
        assert_eq!(RetryPolicy::Infinite.decide(&Ok(false), &delivery(false)).await, Decision::Ack);
    }

    #[tokio::test]
    async fn test_infinite_always_requeues() {
        assert_eq!(RetryPolicy::Infinite.decide(&failure(), &delivery(false)).await, Decision::Requeue);
        assert_eq!(RetryPolicy::Infinite.decide(&failure(), &delivery(true)).await, Decision::Requeue);
    }

    #[tokio::test]
    async fn test_no_retry_drops_failures() {
        assert_eq!(RetryPolicy::NoRetry.decide(&failure(), &delivery(false)).await, Decision::Ack);
    }

    #[tokio::test]
    async fn test_retry_once_uses_redelivered_flag() {
        assert_eq!(RetryPolicy::RetryOnce.decide(&failure(), &delivery(false)).await, Decision::Requeue);
        assert_eq!(RetryPolicy::RetryOnce.decide(&failure(), &delivery(true)).await, Decision::Ack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_with_sleep_pauses_before_requeue() {
        let policy = RetryPolicy::InfiniteWithSleep(Duration::from_millis(100));
        let started = tokio::time::Instant::now();
        assert_eq!(policy.decide(&failure(), &delivery(true)).await, Decision::Requeue);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_with_sleep_does_not_pause_on_success() {
        let policy = RetryPolicy::InfiniteWithSleep(Duration::from_secs(60));
        let started = tokio::time::Instant::now();
        assert_eq!(policy.decide(&Ok(true), &delivery(false)).await, Decision::Ack);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn test_parse_policy_names() {
        assert_eq!("infinite".parse::<RetryPolicy>().unwrap(), RetryPolicy::Infinite);
        assert_eq!("NO_RETRY".parse::<RetryPolicy>().unwrap(), RetryPolicy::NoRetry);
        assert_eq!("retry_once".parse::<RetryPolicy>().unwrap(), RetryPolicy::RetryOnce);
        assert_eq!("handler_result".parse::<RetryPolicy>().unwrap(), RetryPolicy::HandlerResult);
        assert_eq!(
            "infinite_with_sleep:250".parse::<RetryPolicy>().unwrap(),
            RetryPolicy::InfiniteWithSleep(Duration::from_millis(250))
        );
        assert!("infinite_with_sleep".parse::<RetryPolicy>().is_err());
        assert!("infinite_with_sleep:soon".parse::<RetryPolicy>().is_err());
        assert!("forever".parse::<RetryPolicy>().is_err());
    }

    #[test]
    fn test_display_round_trips_sleep() {
        let policy = RetryPolicy::InfiniteWithSleep(Duration::from_millis(500));
        assert_eq!(policy.to_string(), "infinite_with_sleep:500");
        assert_eq!(policy.to_string().parse::<RetryPolicy>().unwrap(), policy);
    }
}
