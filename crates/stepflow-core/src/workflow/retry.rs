//! Step retry policy.
//!
//! Stateless: a step's own `retries` overrides the run-wide
//! [`RetryConfig`]; the delay between attempts is always the run-wide one.

use std::time::Duration;

use stepflow_types::workflow::RetryConfig;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Effective retry policy of one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn resolve(step_retries: Option<u32>, run_config: &RetryConfig) -> Self {
        Self {
            max_retries: step_retries.unwrap_or(run_config.attempts),
            delay: Duration::from_millis(run_config.delay),
        }
    }

    /// Whether another attempt is allowed after `retry_count` retries
    /// (0 after the first failure).
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}
