//! Infrastructure implementations for stepflow.
//!
//! - [`sqlite`]: SQLite-backed [`WorkflowStore`](stepflow_core::repository::workflow::WorkflowStore)
//!   with a split reader/writer pool.
//! - [`config`]: loading [`EngineConfig`](stepflow_types::config::EngineConfig) from disk.

pub mod config;
pub mod sqlite;
