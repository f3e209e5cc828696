//! Storage ports.
//!
//! `WorkflowStore` is implemented in-process by [`memory::InMemoryWorkflowStore`]
//! and durably by `stepflow-infra`'s SQLite store.

pub mod memory;
pub mod workflow;
