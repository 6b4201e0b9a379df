//! Worker error types
//!
//! Errors are split by where they surface:
//! - **WorkerError**: returned from the public worker surface (`listen`, `wait`, construction)
//! - **HandlerError**: produced by a message handler, consumed by the retry policy
//! - **ValidationError**: produced by a handler's payload validator

use std::error::Error as StdError;
use thiserror::Error;

use crate::event::LifecycleEvent;

/// Errors surfaced by the worker's public API and the broker adapters
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Opening the broker connection failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// A channel operation failed (open, qos, assert, bind, consume, ack)
    #[error("Channel error on '{queue}': {message}")]
    Channel { queue: String, message: String },

    /// The connection was closed underneath the worker
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Invalid configuration or options
    #[error("Configuration error: {0}")]
    Config(String),

    /// `wait` did not observe the event in time
    #[error("event {event} didn't occur after {timeout_ms}ms")]
    EventTimeout {
        event: LifecycleEvent,
        timeout_ms: u64,
    },

    /// `listen` was called on a worker that is already listening
    #[error("Worker '{0}' is already listening")]
    AlreadyListening(String),

    /// `listen` was called after shutdown began
    #[error("Worker '{0}' is shutting down")]
    ShuttingDown(String),
}

impl WorkerError {
    /// Create a connection error from any displayable cause
    pub fn connection(cause: impl std::fmt::Display) -> Self {
        WorkerError::Connection(cause.to_string())
    }

    /// Create a channel error for the given queue
    pub fn channel(queue: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        WorkerError::Channel {
            queue: queue.into(),
            message: cause.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        WorkerError::Config(message.into())
    }

    /// Check if this error came from the broker rather than from the caller
    pub fn is_broker_error(&self) -> bool {
        matches!(
            self,
            WorkerError::Connection(_) | WorkerError::Channel { .. } | WorkerError::ConnectionClosed(_)
        )
    }
}

impl From<validator::ValidationErrors> for WorkerError {
    fn from(err: validator::ValidationErrors) -> Self {
        WorkerError::Config(err.to_string())
    }
}

/// Failure of a single handler invocation
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler returned an error
    #[error("{message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    /// The handler did not settle before its deadline
    #[error("Handler timeout in {label} after {timeout_ms}ms")]
    Timeout { label: String, timeout_ms: u64 },

    /// The handler task panicked
    #[error("Handler panicked in {label}")]
    Panicked { label: String },
}

impl HandlerError {
    /// Create a failure with a message only
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a failure wrapping an underlying error
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        HandlerError::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Label used for the `reason` metric and log field
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Failed { .. } => "handler_error",
            HandlerError::Timeout { .. } => "timeout",
            HandlerError::Panicked { .. } => "panic",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HandlerError::Timeout { .. })
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::with_source("Failed to (de)serialize handler data", err)
    }
}

/// Rejection of a payload by a handler's validator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        ValidationError(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<validator::ValidationErrors> for ValidationError {
    fn from(err: validator::ValidationErrors) -> Self {
        ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError(format!("Payload does not match the expected shape: {}", err))
    }
}
