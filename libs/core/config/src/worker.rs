use crate::{env_or_default, env_parse, ConfigError, FromEnv};
use std::time::Duration;

/// Runtime tuning of a worker service
///
/// Defaults match the worker library defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    pub heartbeat: Duration,
    pub task_timeout: Duration,
    pub process_exit_timeout: Duration,
    pub channel_close_timeout: Duration,
    pub channel_prefetch: u16,
    pub close_on_signals: bool,
    /// Retry policy name, e.g. `retry_once` or `infinite_with_sleep:5000`
    pub retry_policy: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(10),
            task_timeout: Duration::from_millis(30_000),
            process_exit_timeout: Duration::from_millis(3_000),
            channel_close_timeout: Duration::from_millis(500),
            channel_prefetch: 100,
            close_on_signals: false,
            retry_policy: "retry_once".to_string(),
        }
    }
}

impl FromEnv for WorkerSettings {
    /// Reads from environment variables, each optional:
    /// - WORKER_HEARTBEAT_SECS (10)
    /// - WORKER_TASK_TIMEOUT_MS (30000)
    /// - WORKER_PROCESS_EXIT_TIMEOUT_MS (3000)
    /// - WORKER_CHANNEL_CLOSE_TIMEOUT_MS (500)
    /// - WORKER_CHANNEL_PREFETCH (100)
    /// - WORKER_CLOSE_ON_SIGNALS (false)
    /// - WORKER_RETRY_POLICY (retry_once)
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            heartbeat: Duration::from_secs(env_parse("WORKER_HEARTBEAT_SECS", defaults.heartbeat.as_secs())?),
            task_timeout: millis("WORKER_TASK_TIMEOUT_MS", defaults.task_timeout)?,
            process_exit_timeout: millis("WORKER_PROCESS_EXIT_TIMEOUT_MS", defaults.process_exit_timeout)?,
            channel_close_timeout: millis("WORKER_CHANNEL_CLOSE_TIMEOUT_MS", defaults.channel_close_timeout)?,
            channel_prefetch: env_parse("WORKER_CHANNEL_PREFETCH", defaults.channel_prefetch)?,
            close_on_signals: env_parse("WORKER_CLOSE_ON_SIGNALS", defaults.close_on_signals)?,
            retry_policy: env_or_default("WORKER_RETRY_POLICY", &defaults.retry_policy),
        })
    }
}

fn millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}
