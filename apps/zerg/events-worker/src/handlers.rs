//! Task event handler
//!
//! Payloads are checked against [`TaskEvent`] before they reach the handler;
//! anything that does not deserialize or validate is dropped by the worker.

use amqp_worker::{DeliveryInfo, HandlerError, HandlerResult, MessageHandler, ValidationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use strum::{Display, EnumString};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

/// Routing key the task service publishes lifecycle events on
pub const TASK_EVENTS_ROUTING_KEY: &str = "task.events";

/// Kind of change announced by a task event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskEventKind {
    Created,
    Updated,
    Completed,
    Deleted,
}

/// A task lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TaskEvent {
    pub task_id: Uuid,
    pub kind: TaskEventKind,
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    pub project_id: Option<Uuid>,
    #[validate(length(max = 64))]
    pub actor: Option<String>,
}

/// Logs task events and counts what it processed
#[derive(Debug, Default)]
pub struct TaskEventHandler {
    processed: AtomicU64,
}

impl TaskEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageHandler for TaskEventHandler {
    fn validate(&self, content: &Value) -> Result<Option<Value>, ValidationError> {
        let event: TaskEvent = serde_json::from_value(content.clone())?;
        event.validate()?;
        // Re-encode so unknown fields never reach the handler
        Ok(Some(serde_json::to_value(&event)?))
    }

    async fn handle(&self, content: Value, delivery: DeliveryInfo) -> HandlerResult {
        let event: TaskEvent = serde_json::from_value(content)?;
        if event.kind == TaskEventKind::Deleted && event.project_id.is_none() {
            return Err(HandlerError::failed(format!(
                "deleted task {} has no project",
                event.task_id
            )));
        }

        info!(
            task_id = %event.task_id,
            kind = %event.kind,
            redelivered = delivery.redelivered,
            "Task event processed"
        );
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }
}
