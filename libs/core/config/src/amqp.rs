use crate::{env_optional, env_or_default, env_required, ConfigError, FromEnv};

/// Broker resources of a worker service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmqpConfig {
    pub url: String,
    pub worker_name: String,
    pub exchange: String,
    pub queue: String,
    pub dead_letter_exchange: Option<String>,
}

impl AmqpConfig {
    pub fn new(url: String, worker_name: String, exchange: String, queue: String) -> Self {
        Self {
            url,
            worker_name,
            exchange,
            queue,
            dead_letter_exchange: None,
        }
    }
}

impl FromEnv for AmqpConfig {
    /// Reads from environment variables:
    /// - AMQP_URL: required
    /// - WORKER_NAME: defaults to "worker"
    /// - AMQP_EXCHANGE: defaults to "events"
    /// - AMQP_QUEUE: defaults to the worker name
    /// - AMQP_DEAD_LETTER_EXCHANGE: optional
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_required("AMQP_URL")?;
        let worker_name = env_or_default("WORKER_NAME", "worker");
        let exchange = env_or_default("AMQP_EXCHANGE", "events");
        let queue = env_or_default("AMQP_QUEUE", &worker_name);

        Ok(Self {
            url,
            worker_name,
            exchange,
            queue,
            dead_letter_exchange: env_optional("AMQP_DEAD_LETTER_EXCHANGE"),
        })
    }
}
