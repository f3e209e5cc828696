//! Workflow definition and execution.
//!
//! Definition side: [`Step`], [`Condition`], [`WorkflowBuilder`] and the
//! committed [`Workflow`]. Execution side: [`EntryExecutor`] runs one graph
//! entry, [`WorkflowEngine`] drives whole runs and owns their lifecycle.

pub mod builder;
pub mod context;
pub mod durable;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod persist;
pub mod retry;
pub mod schema;
pub mod step;

pub use builder::{Workflow, WorkflowBuilder};
pub use context::{ContextChange, ContextDelta, EntryOutcome};
pub use durable::DurableOperations;
pub use engine::{ResumeOptions, ResumeTarget, RunOutcome, StartOptions, TimeTravelOptions, WorkflowEngine};
pub use error::{ConditionError, EngineError, GraphError, StepError};
pub use executor::{EntryExecutor, EntryParams, ResumeParams, RunScope, TimeTravelParams};
pub use graph::{Condition, EvalContext, ForeachOptions, SleepDuration, StepFlowEntry, WakeTime};
pub use persist::{PersistGate, ShouldPersistSnapshot, SnapshotPersister, StepUpdate};
pub use schema::Schema;
pub use step::{Step, StepContext, StepHandler};
