//! Workflow domain types for stepflow.
//!
//! Defines the storage-safe projection of the step graph
//! (`SerializedStepFlowEntry`), per-step execution results (`StepResult`,
//! `StepResults`), run statuses, retry policy and the run-scoped
//! `ExecutionContext`. All field names serialize in camelCase because the
//! persisted snapshot layout is consumed by external tooling.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SerializedError;

/// Key under which the run's initial input is stored in [`StepResults`].
pub const INPUT_KEY: &str = "input";

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of a single step (or flow entry) result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Suspended,
    Waiting,
    Canceled,
}

impl StepStatus {
    /// Whether moving from `self` to `next` is a legal transition within one
    /// execution attempt.
    ///
    /// `running` may settle into `success`, `failed`, `suspended` or
    /// `canceled`; `waiting` (sleep entries) may only wake into `running`.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (
                StepStatus::Running,
                StepStatus::Success
                    | StepStatus::Failed
                    | StepStatus::Suspended
                    | StepStatus::Canceled
            ) | (StepStatus::Waiting, StepStatus::Running)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Suspended => "suspended",
            StepStatus::Waiting => "waiting",
            StepStatus::Canceled => "canceled",
        }
    }
}

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowRunStatus {
    Running,
    Success,
    Failed,
    Suspended,
    Waiting,
    Canceled,
}

impl WorkflowRunStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowRunStatus::Success | WorkflowRunStatus::Failed | WorkflowRunStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRunStatus::Running => "running",
            WorkflowRunStatus::Success => "success",
            WorkflowRunStatus::Failed => "failed",
            WorkflowRunStatus::Suspended => "suspended",
            WorkflowRunStatus::Waiting => "waiting",
            WorkflowRunStatus::Canceled => "canceled",
        }
    }
}

impl From<StepStatus> for WorkflowRunStatus {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::Running => WorkflowRunStatus::Running,
            StepStatus::Success => WorkflowRunStatus::Success,
            StepStatus::Failed => WorkflowRunStatus::Failed,
            StepStatus::Suspended => WorkflowRunStatus::Suspended,
            StepStatus::Waiting => WorkflowRunStatus::Waiting,
            StepStatus::Canceled => WorkflowRunStatus::Canceled,
        }
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Result of executing one flow entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub status: StepStatus,
    /// Output value (present on success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Serialized error (present on failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
    /// The input the entry ran with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_payload: Option<Value>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub suspended_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub resumed_at: Option<DateTime<Utc>>,
    /// Free-form bookkeeping (foreach item statuses, sleep wake time).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl StepResult {
    fn with_status(status: StepStatus, payload: Option<Value>, started_at: DateTime<Utc>) -> Self {
        Self {
            status,
            output: None,
            error: None,
            payload,
            suspend_payload: None,
            resume_payload: None,
            started_at,
            ended_at: None,
            suspended_at: None,
            resumed_at: None,
            metadata: Map::new(),
        }
    }

    /// A freshly started result.
    pub fn running(payload: Option<Value>, started_at: DateTime<Utc>) -> Self {
        Self::with_status(StepStatus::Running, payload, started_at)
    }

    /// A sleep entry parked on its timer.
    pub fn waiting(payload: Option<Value>, started_at: DateTime<Utc>) -> Self {
        Self::with_status(StepStatus::Waiting, payload, started_at)
    }

    /// Wake a parked sleep back into `running`.
    pub fn wake(mut self) -> Self {
        self.enter(StepStatus::Running);
        self
    }

    /// Settle into `success` with the given output.
    pub fn succeed(mut self, output: Value) -> Self {
        self.enter(StepStatus::Success);
        self.output = Some(output);
        self.error = None;
        self.ended_at = Some(Utc::now());
        self
    }

    /// Settle into `failed` with the given error.
    pub fn fail(mut self, error: SerializedError) -> Self {
        self.enter(StepStatus::Failed);
        self.error = Some(error);
        self.ended_at = Some(Utc::now());
        self
    }

    /// Settle into `suspended`, awaiting an external resume.
    pub fn suspend(mut self, suspend_payload: Value) -> Self {
        self.enter(StepStatus::Suspended);
        self.suspend_payload = Some(suspend_payload);
        self.suspended_at = Some(Utc::now());
        self
    }

    /// Force the status to `canceled`, keeping whatever else was recorded.
    ///
    /// Run cancellation overrides any settled status, so this is the one
    /// move not checked against [`StepStatus::can_transition_to`].
    pub fn cancel(mut self) -> Self {
        self.status = StepStatus::Canceled;
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
        self
    }

    fn enter(&mut self, next: StepStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal step transition {} -> {}",
            self.status.as_str(),
            next.as_str()
        );
        self.status = next;
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

// ---------------------------------------------------------------------------
// StepResults
// ---------------------------------------------------------------------------

/// All step results of a run, keyed by step id, plus the run's initial input.
///
/// Serializes flat (`{"input": ..., "<stepId>": {...}}`), which is the shape
/// of the snapshot `context` field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResults {
    #[serde(default)]
    pub input: Value,
    #[serde(flatten)]
    pub steps: IndexMap<String, StepResult>,
}

impl StepResults {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            steps: IndexMap::new(),
        }
    }

    pub fn get(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.get(step_id)
    }

    pub fn insert(&mut self, step_id: impl Into<String>, result: StepResult) {
        self.steps.insert(step_id.into(), result);
    }

    pub fn remove(&mut self, step_id: &str) -> Option<StepResult> {
        self.steps.shift_remove(step_id)
    }

    /// Apply another set of results on top of this one (last write wins).
    pub fn merge(&mut self, other: StepResults) {
        for (id, result) in other.steps {
            self.steps.insert(id, result);
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Retry configuration
// ---------------------------------------------------------------------------

/// Run-wide retry policy consulted by the step executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Extra attempts after the first failure (0 = no retry).
    pub attempts: u32,
    /// Fixed delay between attempts, in milliseconds.
    pub delay: u64,
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Run-scoped execution state.
///
/// `execution_path` is the positional address of the entry being executed:
/// `[i]` for top-level entry `i`, `[i, j]` for branch `j` of a parallel or
/// conditional block, `[i, k]` for iteration `k` of a foreach.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub run_id: String,
    #[serde(default)]
    pub execution_path: Vec<usize>,
    #[serde(default)]
    pub suspended_paths: BTreeMap<String, Vec<usize>>,
    #[serde(default)]
    pub active_steps_path: BTreeMap<String, Vec<usize>>,
    #[serde(default)]
    pub resume_labels: BTreeMap<String, Vec<usize>>,
    #[serde(default)]
    pub retry_config: RetryConfig,
    #[serde(default)]
    pub state: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        retry_config: RetryConfig,
        state: Map<String, Value>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            execution_path: Vec::new(),
            suspended_paths: BTreeMap::new(),
            active_steps_path: BTreeMap::new(),
            resume_labels: BTreeMap::new(),
            retry_config,
            state,
        }
    }

    /// Copy of this context addressed at `path`.
    pub fn at_path(&self, path: Vec<usize>) -> Self {
        let mut ctx = self.clone();
        ctx.execution_path = path;
        ctx
    }
}

// ---------------------------------------------------------------------------
// Serialized step graph
// ---------------------------------------------------------------------------

/// Kind of loop entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopType {
    /// Repeat the body while the condition holds.
    DoWhile,
    /// Repeat the body until the condition holds.
    DoUntil,
}

/// What a foreach does when one of its items fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeachFailurePolicy {
    /// Stop scheduling new items after the first failure.
    #[default]
    FailFast,
    /// Run every item, then fail with all collected item errors.
    CollectErrors,
}

/// Storage-safe view of a user step (closures stripped).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedStep {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// A condition predicate as persisted: only its label survives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedCondition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Foreach options as persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedForeachOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub failure_policy: ForeachFailurePolicy,
}

/// Wire/storage projection of a step flow entry.
///
/// Round-trips structurally: ids and nesting survive, execution closures do
/// not (computed sleep durations and wake times persist as `null`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SerializedStepFlowEntry {
    Step {
        step: SerializedStep,
    },
    Parallel {
        id: String,
        steps: Vec<SerializedStepFlowEntry>,
    },
    Conditional {
        id: String,
        steps: Vec<SerializedStepFlowEntry>,
        serialized_conditions: Vec<SerializedCondition>,
    },
    Loop {
        id: String,
        step: Box<SerializedStepFlowEntry>,
        serialized_condition: SerializedCondition,
        loop_type: LoopType,
    },
    Foreach {
        id: String,
        step: Box<SerializedStepFlowEntry>,
        opts: SerializedForeachOptions,
    },
    Sleep {
        id: String,
        /// Fixed duration in milliseconds; `None` when computed at runtime.
        #[serde(default)]
        duration: Option<u64>,
    },
    SleepUntil {
        id: String,
        /// Fixed wake time; `None` when computed at runtime.
        #[serde(default)]
        date: Option<DateTime<Utc>>,
    },
}

impl SerializedStepFlowEntry {
    /// Stable id of the entry (the step id for step entries).
    pub fn id(&self) -> &str {
        match self {
            SerializedStepFlowEntry::Step { step } => &step.id,
            SerializedStepFlowEntry::Parallel { id, .. }
            | SerializedStepFlowEntry::Conditional { id, .. }
            | SerializedStepFlowEntry::Loop { id, .. }
            | SerializedStepFlowEntry::Foreach { id, .. }
            | SerializedStepFlowEntry::Sleep { id, .. }
            | SerializedStepFlowEntry::SleepUntil { id, .. } => id,
        }
    }

    /// Ids that may appear as keys in `stepResults` for this entry.
    pub fn result_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.collect_result_ids(&mut ids);
        ids
    }

    fn collect_result_ids(&self, ids: &mut Vec<String>) {
        match self {
            SerializedStepFlowEntry::Step { step } => ids.push(step.id.clone()),
            SerializedStepFlowEntry::Parallel { steps, .. }
            | SerializedStepFlowEntry::Conditional { steps, .. } => {
                for child in steps {
                    child.collect_result_ids(ids);
                }
            }
            SerializedStepFlowEntry::Loop { step, .. }
            | SerializedStepFlowEntry::Foreach { step, .. } => step.collect_result_ids(ids),
            SerializedStepFlowEntry::Sleep { id, .. }
            | SerializedStepFlowEntry::SleepUntil { id, .. } => ids.push(id.clone()),
        }
    }

    /// Positional path of `step_id` inside this entry, relative to it.
    fn locate(&self, step_id: &str) -> Option<Vec<usize>> {
        match self {
            SerializedStepFlowEntry::Step { step } => (step.id == step_id).then(Vec::new),
            SerializedStepFlowEntry::Parallel { steps, .. }
            | SerializedStepFlowEntry::Conditional { steps, .. } => {
                steps.iter().enumerate().find_map(|(j, child)| {
                    child.locate(step_id).map(|rest| {
                        let mut path = vec![j];
                        path.extend(rest);
                        path
                    })
                })
            }
            SerializedStepFlowEntry::Loop { step, .. }
            | SerializedStepFlowEntry::Foreach { step, .. } => step.locate(step_id),
            SerializedStepFlowEntry::Sleep { id, .. }
            | SerializedStepFlowEntry::SleepUntil { id, .. } => (id == step_id).then(Vec::new),
        }
    }
}

/// Find the execution path of `step_id` within a serialized graph.
pub fn locate_step(graph: &[SerializedStepFlowEntry], step_id: &str) -> Option<Vec<usize>> {
    graph.iter().enumerate().find_map(|(i, entry)| {
        entry.locate(step_id).map(|rest| {
            let mut path = vec![i];
            path.extend(rest);
            path
        })
    })
}

/// Every id that may key `stepResults` for the given graph.
pub fn reachable_step_ids(graph: &[SerializedStepFlowEntry]) -> Vec<String> {
    graph.iter().flat_map(|entry| entry.result_ids()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
