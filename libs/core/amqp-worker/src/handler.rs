//! Message handler trait and routing-key bindings

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::broker::DeliveryInfo;
use crate::error::{HandlerError, ValidationError};
use crate::retry::RetryPolicy;

/// Outcome of a handler invocation.
///
/// The boolean is only consulted by [`RetryPolicy::HandlerResult`].
pub type HandlerResult = Result<bool, HandlerError>;

/// User code processing messages for one routing key
///
/// # Example
///
/// ```ignore
/// struct AuditHandler;
///
/// #[async_trait]
/// impl MessageHandler for AuditHandler {
///     fn validate(&self, content: &Value) -> Result<Option<Value>, ValidationError> {
///         let event: AuditEvent = serde_json::from_value(content.clone())?;
///         event.validate()?;
///         Ok(None)
///     }
///
///     async fn handle(&self, content: Value, delivery: DeliveryInfo) -> HandlerResult {
///         store_audit_event(content).await?;
///         Ok(true)
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Check a decoded payload before it reaches [`handle`](Self::handle).
    ///
    /// Returning `Ok(Some(value))` replaces the payload; `Ok(None)` passes the
    /// decoded payload through unchanged. Errors drop the message.
    fn validate(&self, content: &Value) -> Result<Option<Value>, ValidationError> {
        let _ = content;
        Ok(None)
    }

    async fn handle(&self, content: Value, delivery: DeliveryInfo) -> HandlerResult;
}

/// A handler bound to a routing key with its retry policy
#[derive(Clone)]
pub struct HandlerBinding {
    routing_key: String,
    handler: Arc<dyn MessageHandler>,
    policy: RetryPolicy,
}

impl HandlerBinding {
    pub fn new(routing_key: impl Into<String>, handler: impl MessageHandler, policy: RetryPolicy) -> Self {
        Self::from_arc(routing_key, Arc::new(handler), policy)
    }

    /// Bind a handler shared with other bindings or with the caller
    pub fn from_arc(routing_key: impl Into<String>, handler: Arc<dyn MessageHandler>, policy: RetryPolicy) -> Self {
        Self {
            routing_key: routing_key.into(),
            handler,
            policy,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Queue consumed by this binding: `<base>.<routing_key>`
    pub fn queue_name(&self, base_queue: &str) -> String {
        format!("{}.{}", base_queue, self.routing_key)
    }
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("routing_key", &self.routing_key)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
