//! Fluent workflow construction.
//!
//! [`WorkflowBuilder`] appends entries to the step graph in declaration
//! order and [`WorkflowBuilder::commit`] validates the result into an
//! immutable [`Workflow`]. Ids of composite entries are derived from their
//! position (`parallel-1`, `sleep-3`), so rebuilding the same workflow in a
//! new process yields the same graph a persisted run refers to.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use stepflow_types::workflow::{INPUT_KEY, LoopType, RetryConfig, SerializedStepFlowEntry};

use super::error::GraphError;
use super::graph::{Condition, EvalContext, ForeachOptions, SleepDuration, StepFlowEntry, WakeTime};
use super::persist::{PersistGate, ShouldPersistSnapshot};
use super::schema::Schema;
use super::step::Step;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A committed, immutable workflow definition.
#[derive(Clone)]
pub struct Workflow {
    id: String,
    description: Option<String>,
    input_schema: Option<Schema>,
    output_schema: Option<Schema>,
    retry_config: Option<RetryConfig>,
    graph: Arc<[StepFlowEntry]>,
    serialized: Arc<[SerializedStepFlowEntry]>,
    should_persist_snapshot: Option<ShouldPersistSnapshot>,
}

impl Workflow {
    pub fn builder(id: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn graph(&self) -> &[StepFlowEntry] {
        &self.graph
    }

    pub fn serialized_graph(&self) -> &[SerializedStepFlowEntry] {
        &self.serialized
    }

    pub fn input_validator(&self) -> Option<&Schema> {
        self.input_schema.as_ref()
    }

    pub fn output_validator(&self) -> Option<&Schema> {
        self.output_schema.as_ref()
    }

    /// Retry policy declared on the workflow, if any.
    pub fn retry_config(&self) -> Option<RetryConfig> {
        self.retry_config
    }

    pub fn should_persist_snapshot(&self) -> Option<&ShouldPersistSnapshot> {
        self.should_persist_snapshot.as_ref()
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("entries", &self.graph.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

/// Builder for [`Workflow`].
pub struct WorkflowBuilder {
    id: String,
    description: Option<String>,
    input_schema: Option<Schema>,
    output_schema: Option<Schema>,
    retry_config: Option<RetryConfig>,
    graph: Vec<StepFlowEntry>,
    should_persist_snapshot: Option<ShouldPersistSnapshot>,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            input_schema: None,
            output_schema: None,
            retry_config: None,
            graph: Vec::new(),
            should_persist_snapshot: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn input_schema(mut self, schema: impl Into<Schema>) -> Self {
        self.input_schema = Some(schema.into());
        self
    }

    pub fn output_schema(mut self, schema: impl Into<Schema>) -> Self {
        self.output_schema = Some(schema.into());
        self
    }

    pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = Some(retry_config);
        self
    }

    /// Gate deciding whether a step update is written to storage.
    pub fn should_persist_snapshot<F>(mut self, gate: F) -> Self
    where
        F: Fn(&PersistGate<'_>) -> bool + Send + Sync + 'static,
    {
        self.should_persist_snapshot = Some(Arc::new(gate));
        self
    }

    fn next_id(&self, kind: &str) -> String {
        format!("{kind}-{}", self.graph.len())
    }

    /// Append a raw entry.
    pub fn entry(mut self, entry: StepFlowEntry) -> Self {
        self.graph.push(entry);
        self
    }

    pub fn then(self, step: Step) -> Self {
        self.entry(StepFlowEntry::Step(step))
    }

    pub fn parallel(self, steps: impl IntoIterator<Item = Step>) -> Self {
        let id = self.next_id("parallel");
        let steps = steps.into_iter().map(StepFlowEntry::Step).collect();
        self.entry(StepFlowEntry::Parallel { id, steps })
    }

    /// Conditional block; every branch whose condition holds runs.
    pub fn branch(self, branches: impl IntoIterator<Item = (Condition, Step)>) -> Self {
        let id = self.next_id("conditional");
        let (conditions, steps): (Vec<_>, Vec<_>) = branches
            .into_iter()
            .map(|(condition, step)| (condition, StepFlowEntry::Step(step)))
            .unzip();
        self.entry(StepFlowEntry::Conditional { id, steps, conditions })
    }

    pub fn dowhile(self, step: Step, condition: Condition) -> Self {
        self.loop_entry(step, condition, LoopType::DoWhile)
    }

    pub fn dountil(self, step: Step, condition: Condition) -> Self {
        self.loop_entry(step, condition, LoopType::DoUntil)
    }

    fn loop_entry(self, step: Step, condition: Condition, loop_type: LoopType) -> Self {
        let id = self.next_id("loop");
        self.entry(StepFlowEntry::Loop {
            id,
            step: Box::new(StepFlowEntry::Step(step)),
            condition,
            loop_type,
        })
    }

    pub fn foreach(self, step: Step, options: ForeachOptions) -> Self {
        let id = self.next_id("foreach");
        self.entry(StepFlowEntry::Foreach {
            id,
            step: Box::new(StepFlowEntry::Step(step)),
            options,
        })
    }

    pub fn sleep(self, duration: Duration) -> Self {
        let id = self.next_id("sleep");
        self.entry(StepFlowEntry::Sleep {
            id,
            duration: SleepDuration::Fixed(duration),
        })
    }

    /// Sleep for a duration computed when the entry is reached.
    pub fn sleep_fn<F>(self, duration: F) -> Self
    where
        F: Fn(&EvalContext) -> Duration + Send + Sync + 'static,
    {
        let id = self.next_id("sleep");
        self.entry(StepFlowEntry::Sleep {
            id,
            duration: SleepDuration::Computed(Arc::new(duration)),
        })
    }

    pub fn sleep_until(self, wake: DateTime<Utc>) -> Self {
        let id = self.next_id("sleep-until");
        self.entry(StepFlowEntry::SleepUntil {
            id,
            wake: WakeTime::At(wake),
        })
    }

    /// Sleep until a time computed when the entry is reached.
    pub fn sleep_until_fn<F>(self, wake: F) -> Self
    where
        F: Fn(&EvalContext) -> DateTime<Utc> + Send + Sync + 'static,
    {
        let id = self.next_id("sleep-until");
        self.entry(StepFlowEntry::SleepUntil {
            id,
            wake: WakeTime::Computed(Arc::new(wake)),
        })
    }

    /// Validate and freeze the graph.
    pub fn commit(self) -> Result<Workflow, GraphError> {
        if self.graph.is_empty() {
            return Err(GraphError::Empty);
        }
        let mut seen = HashSet::new();
        for entry in &self.graph {
            check_ids(entry, &mut seen)?;
        }

        let serialized: Vec<SerializedStepFlowEntry> = self.graph.iter().map(StepFlowEntry::serialize).collect();
        tracing::debug!(workflow_id = %self.id, entries = self.graph.len(), "workflow committed");

        Ok(Workflow {
            id: self.id,
            description: self.description,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
            retry_config: self.retry_config,
            graph: self.graph.into(),
            serialized: serialized.into(),
            should_persist_snapshot: self.should_persist_snapshot,
        })
    }
}

fn check_ids(entry: &StepFlowEntry, seen: &mut HashSet<String>) -> Result<(), GraphError> {
    let id = entry.id();
    if id.is_empty() {
        return Err(GraphError::EmptyStepId);
    }
    if id == INPUT_KEY {
        return Err(GraphError::ReservedStepId(id.to_string()));
    }
    if !seen.insert(id.to_string()) {
        return Err(GraphError::DuplicateStepId(id.to_string()));
    }
    match entry {
        StepFlowEntry::Parallel { steps, .. } | StepFlowEntry::Conditional { steps, .. } => {
            steps.iter().try_for_each(|child| check_ids(child, seen))
        }
        StepFlowEntry::Loop { step, .. } | StepFlowEntry::Foreach { step, .. } => check_ids(step, seen),
        _ => Ok(()),
    }
}
