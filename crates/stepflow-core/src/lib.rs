//! Execution core for stepflow.
//!
//! This crate interprets a workflow's step graph: it runs individual steps,
//! fans out parallel and conditional branches, iterates loops and foreach
//! entries, parks sleeps, and persists a snapshot after each step so a run
//! can suspend, resume, restart after a crash, or time travel.
//!
//! It defines the "ports" (`WorkflowStore`, `PubSub`, `TrackingSink`) that
//! the infrastructure layer implements, and ships in-memory versions of each.
//! It depends only on `stepflow-types`, never on `stepflow-infra`.

pub mod event;
pub mod repository;
pub mod request_context;
pub mod telemetry;
pub mod workflow;

pub use request_context::RequestContext;
