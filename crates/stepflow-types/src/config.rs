//! Engine configuration types.
//!
//! Loaded from `stepflow.toml` by `stepflow-infra::config`; every field has a
//! default so a missing or partial file is valid.

use serde::{Deserialize, Serialize};

use crate::workflow::RetryConfig;

/// When snapshot updates are written to storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    /// Persist every step update.
    #[default]
    Always,
    /// Persist only when the run status differs from `running`.
    OnStatusChange,
}

/// Snapshot persistence settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub policy: SnapshotPolicy,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default concurrency of foreach entries that do not set their own.
    pub foreach_concurrency: usize,
    /// Capacity of the bounded event publishing queue.
    pub event_queue_capacity: usize,
    /// Capacity of each per-run watch broadcast channel.
    pub watch_channel_capacity: usize,
    /// Run-wide step retry policy.
    pub retry: RetryConfig,
    pub snapshots: SnapshotConfig,
    /// SQLite database URL for the snapshot store (None = default location).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            foreach_concurrency: 1,
            event_queue_capacity: 1024,
            watch_channel_capacity: 256,
            retry: RetryConfig::default(),
            snapshots: SnapshotConfig::default(),
            database_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sequential_and_always_persist() {
        let config = EngineConfig::default();
        assert_eq!(config.foreach_concurrency, 1);
        assert_eq!(config.snapshots.policy, SnapshotPolicy::Always);
        assert_eq!(config.retry.attempts, 0);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
foreach_concurrency = 4

[retry]
attempts = 2
delay = 50

[snapshots]
policy = "on_status_change"
"#,
        )
        .unwrap();
        assert_eq!(config.foreach_concurrency, 4);
        assert_eq!(config.retry.attempts, 2);
        assert_eq!(config.retry.delay, 50);
        assert_eq!(config.snapshots.policy, SnapshotPolicy::OnStatusChange);
        assert_eq!(config.event_queue_capacity, 1024);
    }
}
