//! Shared test utilities for worker testing
//!
//! This crate provides reusable test infrastructure for the workspace crates:
//! - `TestRabbitMq`: RabbitMQ container with automatic cleanup (feature: "rabbitmq")
//! - `TestDataBuilder`: Deterministic broker resource names (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Features
//!
//! - `rabbitmq`: Enables RabbitMQ test infrastructure
//! - `all`: Enables all broker test infrastructure
//!
//! # Usage
//!
//! Add `features = ["rabbitmq"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["rabbitmq"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRabbitMq};
//!
//! #[tokio::test]
//! async fn my_rabbitmq_test() {
//!     let rabbitmq = TestRabbitMq::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_rabbitmq_test");
//!
//!     let exchange = builder.exchange("events");
//!     let queue = builder.queue("events");
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "rabbitmq")]
mod rabbitmq;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::TestRabbitMq;

/// Builder for test data with deterministic randomization
///
/// Tests sharing one broker stay isolated as long as each uses its own names.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_retry_once");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic message ID
    pub fn message_id(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }

    /// Generate a unique name for testing
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(12345);
    /// assert_eq!(builder.name("queue", "main"), "test-queue-12345-main");
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }

    pub fn exchange(&self, suffix: &str) -> String {
        self.name("exchange", suffix)
    }

    pub fn queue(&self, suffix: &str) -> String {
        self.name("queue", suffix)
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::future::Future;
    use std::time::Duration;

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Poll `check` until it returns true, panicking after `timeout`
    pub async fn assert_eventually<F, Fut>(timeout: Duration, context: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check().await {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("{}: condition not met after {:?}", context, timeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.message_id(), builder2.message_id());
        assert_eq!(builder1.queue("main"), builder2.queue("main"));
        assert_eq!(builder1.exchange("dlx"), "test-exchange-42-dlx");
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        // Different test names should generate different data
        assert_ne!(builder1.message_id(), builder2.message_id());
        assert_ne!(builder1.queue("main"), builder2.queue("main"));
    }

    #[tokio::test]
    async fn test_assert_eventually_passes() {
        let mut calls = 0;
        assertions::assert_eventually(Duration::from_secs(1), "counter", || {
            calls += 1;
            let done = calls >= 3;
            async move { done }
        })
        .await;
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    #[should_panic(expected = "never: condition not met")]
    async fn test_assert_eventually_times_out() {
        assertions::assert_eventually(Duration::from_millis(100), "never", || async { false }).await;
    }
}
