//! The executable step graph.
//!
//! A workflow is an ordered list of [`StepFlowEntry`] values. Entries carry
//! closures (step handlers, predicates, computed sleep durations), so the
//! graph itself is not serializable; [`StepFlowEntry::serialize`] produces
//! the storage-safe [`SerializedStepFlowEntry`] kept in snapshots.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use stepflow_types::workflow::{
    ForeachFailurePolicy, LoopType, SerializedCondition, SerializedForeachOptions,
    SerializedStepFlowEntry, StepResult, StepResults,
};

use super::error::ConditionError;
use super::step::Step;
use crate::request_context::RequestContext;

// ---------------------------------------------------------------------------
// Evaluation context
// ---------------------------------------------------------------------------

/// Read-only view handed to predicates and computed sleep callbacks.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub run_id: String,
    pub workflow_id: String,
    /// The entry's input (for loop conditions, the body's latest output).
    pub input: Value,
    pub state: Map<String, Value>,
    pub step_results: Arc<StepResults>,
    /// Completed loop iterations (0 outside loops).
    pub iteration_count: u32,
    pub request_context: RequestContext,
}

impl EvalContext {
    /// Output of an earlier successful step.
    pub fn get_step_result(&self, step_id: &str) -> Option<&Value> {
        self.step_results
            .get(step_id)
            .filter(|r| r.is_success())
            .and_then(|r| r.output.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

pub type ConditionFuture = Pin<Box<dyn Future<Output = Result<bool, ConditionError>> + Send>>;

type ConditionFn = dyn Fn(EvalContext) -> ConditionFuture + Send + Sync;

/// A predicate gating a conditional branch or a loop iteration.
#[derive(Clone)]
pub struct Condition {
    description: Option<String>,
    predicate: Arc<ConditionFn>,
}

impl Condition {
    /// Async predicate.
    pub fn new<F, Fut>(predicate: F) -> Self
    where
        F: Fn(EvalContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, ConditionError>> + Send + 'static,
    {
        Self {
            description: None,
            predicate: Arc::new(move |ctx: EvalContext| -> ConditionFuture { Box::pin(predicate(ctx)) }),
        }
    }

    /// Synchronous predicate.
    pub fn sync<F>(predicate: F) -> Self
    where
        F: Fn(&EvalContext) -> Result<bool, ConditionError> + Send + Sync + 'static,
    {
        Self::new(move |ctx: EvalContext| std::future::ready(predicate(&ctx)))
    }

    /// Human-readable label stored in the serialized graph.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub async fn evaluate(&self, ctx: EvalContext) -> Result<bool, ConditionError> {
        (self.predicate)(ctx).await
    }

    pub(crate) fn serialize(&self, id: String) -> SerializedCondition {
        SerializedCondition {
            id,
            description: self.description.clone(),
        }
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Sleep timing
// ---------------------------------------------------------------------------

/// How long a sleep entry waits.
#[derive(Clone)]
pub enum SleepDuration {
    Fixed(Duration),
    Computed(Arc<dyn Fn(&EvalContext) -> Duration + Send + Sync>),
}

/// When a sleep-until entry wakes.
#[derive(Clone)]
pub enum WakeTime {
    At(DateTime<Utc>),
    Computed(Arc<dyn Fn(&EvalContext) -> DateTime<Utc> + Send + Sync>),
}

impl std::fmt::Debug for SleepDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SleepDuration::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            SleepDuration::Computed(_) => f.write_str("Computed"),
        }
    }
}

impl std::fmt::Debug for WakeTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WakeTime::At(at) => f.debug_tuple("At").field(at).finish(),
            WakeTime::Computed(_) => f.write_str("Computed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Foreach options
// ---------------------------------------------------------------------------

/// Options of a foreach entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForeachOptions {
    /// Items in flight at once; `None` uses the engine default.
    pub concurrency: Option<usize>,
    pub failure_policy: ForeachFailurePolicy,
}

impl ForeachOptions {
    pub fn concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: Some(concurrency),
            ..Self::default()
        }
    }

    pub fn collect_errors(mut self) -> Self {
        self.failure_policy = ForeachFailurePolicy::CollectErrors;
        self
    }
}

// ---------------------------------------------------------------------------
// StepFlowEntry
// ---------------------------------------------------------------------------

/// One node of the step graph.
#[derive(Debug, Clone)]
pub enum StepFlowEntry {
    /// A single user step.
    Step(Step),
    /// Run every child concurrently; the output maps child id to output.
    Parallel { id: String, steps: Vec<StepFlowEntry> },
    /// Run every child whose predicate (same index) holds.
    Conditional {
        id: String,
        steps: Vec<StepFlowEntry>,
        conditions: Vec<Condition>,
    },
    /// Run `step` repeatedly; the body always runs at least once.
    Loop {
        id: String,
        step: Box<StepFlowEntry>,
        condition: Condition,
        loop_type: LoopType,
    },
    /// Run `step` once per element of the input array.
    Foreach {
        id: String,
        step: Box<StepFlowEntry>,
        options: ForeachOptions,
    },
    Sleep { id: String, duration: SleepDuration },
    SleepUntil { id: String, wake: WakeTime },
}

impl StepFlowEntry {
    pub fn id(&self) -> &str {
        match self {
            StepFlowEntry::Step(step) => step.id(),
            StepFlowEntry::Parallel { id, .. }
            | StepFlowEntry::Conditional { id, .. }
            | StepFlowEntry::Loop { id, .. }
            | StepFlowEntry::Foreach { id, .. }
            | StepFlowEntry::Sleep { id, .. }
            | StepFlowEntry::SleepUntil { id, .. } => id,
        }
    }

    /// Key under which this entry's settled result is recorded in
    /// `stepResults` (loops and foreach record under their body's key).
    pub fn result_key(&self) -> &str {
        match self {
            StepFlowEntry::Loop { step, .. } | StepFlowEntry::Foreach { step, .. } => step.result_key(),
            other => other.id(),
        }
    }

    /// The settled result of this entry, if recorded.
    ///
    /// Parallel and conditional blocks have no result of their own; their
    /// view is rebuilt from the children that ran.
    pub fn recorded_result<'r>(&self, results: &'r StepResults) -> Option<&'r StepResult> {
        match self {
            StepFlowEntry::Parallel { .. } | StepFlowEntry::Conditional { .. } => None,
            other => results.get(other.result_key()),
        }
    }

    /// Storage-safe projection.
    pub fn serialize(&self) -> SerializedStepFlowEntry {
        match self {
            StepFlowEntry::Step(step) => SerializedStepFlowEntry::Step {
                step: step.serialize(),
            },
            StepFlowEntry::Parallel { id, steps } => SerializedStepFlowEntry::Parallel {
                id: id.clone(),
                steps: steps.iter().map(StepFlowEntry::serialize).collect(),
            },
            StepFlowEntry::Conditional { id, steps, conditions } => SerializedStepFlowEntry::Conditional {
                id: id.clone(),
                steps: steps.iter().map(StepFlowEntry::serialize).collect(),
                serialized_conditions: conditions
                    .iter()
                    .enumerate()
                    .map(|(j, c)| c.serialize(format!("{id}-condition-{j}")))
                    .collect(),
            },
            StepFlowEntry::Loop {
                id,
                step,
                condition,
                loop_type,
            } => SerializedStepFlowEntry::Loop {
                id: id.clone(),
                step: Box::new(step.serialize()),
                serialized_condition: condition.serialize(format!("{id}-condition")),
                loop_type: *loop_type,
            },
            StepFlowEntry::Foreach { id, step, options } => SerializedStepFlowEntry::Foreach {
                id: id.clone(),
                step: Box::new(step.serialize()),
                opts: SerializedForeachOptions {
                    concurrency: options.concurrency,
                    failure_policy: options.failure_policy,
                },
            },
            StepFlowEntry::Sleep { id, duration } => SerializedStepFlowEntry::Sleep {
                id: id.clone(),
                duration: match duration {
                    SleepDuration::Fixed(d) => Some(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                    SleepDuration::Computed(_) => None,
                },
            },
            StepFlowEntry::SleepUntil { id, wake } => SerializedStepFlowEntry::SleepUntil {
                id: id.clone(),
                date: match wake {
                    WakeTime::At(at) => Some(*at),
                    WakeTime::Computed(_) => None,
                },
            },
        }
    }
}

/// Input of the entry that follows `previous`.
///
/// The first entry reads the run input. A parallel or conditional
/// predecessor yields `{ childId: output }` over its successful children.
pub fn previous_output(previous: Option<&StepFlowEntry>, results: &StepResults) -> Value {
    let Some(previous) = previous else {
        return results.input.clone();
    };
    match previous {
        StepFlowEntry::Parallel { steps, .. } | StepFlowEntry::Conditional { steps, .. } => {
            let mut outputs = Map::new();
            for child in steps {
                if let Some(result) = child.recorded_result(results).filter(|r| r.is_success()) {
                    outputs.insert(
                        child.result_key().to_string(),
                        result.output.clone().unwrap_or(Value::Null),
                    );
                }
            }
            Value::Object(outputs)
        }
        other => other
            .recorded_result(results)
            .and_then(|r| r.output.clone())
            .unwrap_or(Value::Null),
    }
}
