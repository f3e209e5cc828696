//! Shared domain types for the stepflow workflow engine.
//!
//! Everything in this crate is plain data: step results, run statuses, the
//! serialized step graph, the execution context, the persisted snapshot
//! document, watch events and error types. Zero runtime dependencies beyond
//! serde, chrono, indexmap and thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod snapshot;
pub mod workflow;
