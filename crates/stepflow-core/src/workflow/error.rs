//! Error types of the workflow engine.

use stepflow_types::error::{DomainError, SerializedError, StoreError};
use stepflow_types::workflow::WorkflowRunStatus;
use thiserror::Error;

/// Error returned by a step handler.
///
/// Any of these settles the step as `failed` (after retries are exhausted);
/// none of them aborts the engine.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("input validation failed: {0}")]
    InvalidInput(String),

    #[error("output validation failed: {0}")]
    InvalidOutput(String),

    #[error("resume data validation failed: {0}")]
    InvalidResumeData(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Storage-safe projection recorded on the failed step result.
    pub fn to_serialized(&self) -> SerializedError {
        match self {
            StepError::Domain(err) => err.to_serialized(),
            StepError::Other(err) => {
                let source: &(dyn std::error::Error + 'static) = err.as_ref();
                let mut serialized = SerializedError::from_error(source);
                serialized.message = err.to_string();
                serialized
            }
            other => SerializedError::from_error(other),
        }
    }
}

/// Error returned by a condition predicate.
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised while assembling a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("workflow has no steps")]
    Empty,

    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("step id is reserved: {0}")]
    ReservedStepId(String),

    #[error("step id must not be empty")]
    EmptyStepId,
}

/// Errors returned by the engine's public operations.
///
/// Step failures never surface here; they settle the run as `failed`.
/// These are caller mistakes (unknown run, bad resume target) and
/// infrastructure failures that could not be recorded on the run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid workflow: {0}")]
    Graph(#[from] GraphError),

    #[error("run not found: {workflow_id}/{run_id}")]
    RunNotFound { workflow_id: String, run_id: String },

    #[error("run {run_id} is {status:?}, expected {expected}")]
    InvalidRunStatus {
        run_id: String,
        status: WorkflowRunStatus,
        expected: &'static str,
    },

    #[error("run {run_id} is already executing")]
    RunActive { run_id: String },

    #[error("invalid resume path {path:?}: {reason}")]
    InvalidResumePath { path: Vec<usize>, reason: String },

    #[error("no suspended step matches {0}")]
    NothingToResume(String),

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("invalid workflow input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the error came from the storage layer.
    pub fn is_storage(&self) -> bool {
        matches!(self, EngineError::Store(_))
    }
}
