//! The persisted workflow snapshot document.
//!
//! One snapshot exists per `(workflowName, runId)`. It is overwritten (never
//! appended) on every persisted update and is the only durable source of
//! truth for resuming a run after a process restart. Field names and nesting
//! are a compatibility contract with existing persisted runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SerializedError;
use crate::workflow::{SerializedStepFlowEntry, StepResults, WorkflowRunStatus};

/// Latest-state view of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    pub run_id: String,
    pub status: WorkflowRunStatus,
    /// Workflow state (`ExecutionContext.state`).
    #[serde(default)]
    pub value: Map<String, Value>,
    /// Step results keyed by step id, plus the run input under `input`.
    pub context: StepResults,
    /// Execution path of the entry that produced this snapshot.
    #[serde(default)]
    pub active_paths: Vec<usize>,
    #[serde(default)]
    pub active_steps_path: BTreeMap<String, Vec<usize>>,
    #[serde(default)]
    pub serialized_step_graph: Vec<SerializedStepFlowEntry>,
    #[serde(default)]
    pub suspended_paths: BTreeMap<String, Vec<usize>>,
    #[serde(default)]
    pub resume_labels: BTreeMap<String, Vec<usize>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<SerializedError>,
    /// Serializable projection of the request context.
    #[serde(default)]
    pub request_context: Map<String, Value>,
    /// Milliseconds since the Unix epoch at write time.
    pub timestamp: i64,
}

/// Parameters of a snapshot write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistSnapshotParams {
    pub workflow_name: String,
    pub run_id: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    pub snapshot: WorkflowSnapshot,
}

/// Summary row returned by run listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunRecord {
    pub workflow_name: String,
    pub run_id: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    pub status: WorkflowRunStatus,
    pub updated_at: i64,
}
