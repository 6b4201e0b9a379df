//! Prometheus metrics for AMQP workers
//!
//! Provides observability into message throughput and failure reasons.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. When another
/// recorder is already installed the worker keeps running without the
/// Prometheus exporter.
pub fn init_metrics() {
    let result = PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
    });

    if let Err(e) = result {
        warn!(error = %e, "Failed to install Prometheus recorder");
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn get_metrics_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    get_metrics_handle().map(|h| h.render()).unwrap_or_default()
}

/// Per-binding metrics helper
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    worker_name: String,
    routing_key: String,
}

impl WorkerMetrics {
    pub fn new(worker_name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            routing_key: routing_key.into(),
        }
    }

    pub fn message_received(&self, redelivered: bool) {
        counter!(
            "amqp_worker_messages_received_total",
            "worker" => self.worker_name.clone(),
            "routing_key" => self.routing_key.clone(),
            "redelivered" => redelivered.to_string()
        )
        .increment(1);
    }

    pub fn task_completed(&self, duration: Duration) {
        counter!(
            "amqp_worker_tasks_completed_total",
            "worker" => self.worker_name.clone(),
            "routing_key" => self.routing_key.clone()
        )
        .increment(1);

        histogram!(
            "amqp_worker_task_duration_seconds",
            "worker" => self.worker_name.clone(),
            "routing_key" => self.routing_key.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn task_retried(&self) {
        counter!(
            "amqp_worker_tasks_retried_total",
            "worker" => self.worker_name.clone(),
            "routing_key" => self.routing_key.clone()
        )
        .increment(1);
    }

    /// Record a dropped message; `reason` is e.g. `decode`, `validation`, `timeout`
    pub fn task_failed(&self, reason: &str) {
        counter!(
            "amqp_worker_tasks_failed_total",
            "worker" => self.worker_name.clone(),
            "routing_key" => self.routing_key.clone(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn in_flight(&self, count: usize) {
        gauge!(
            "amqp_worker_in_flight_messages",
            "worker" => self.worker_name.clone(),
            "routing_key" => self.routing_key.clone()
        )
        .set(count as f64);
    }
}
