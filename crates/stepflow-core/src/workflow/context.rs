//! Execution-context changes produced by running an entry.
//!
//! Entries never mutate the shared [`ExecutionContext`] directly. Each one
//! returns a [`ContextDelta`], an ordered log of changes; concurrent
//! branches' deltas are concatenated in completion order and applied by the
//! caller, so the last write to any key wins.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use stepflow_types::workflow::{ExecutionContext, StepResult, StepResults};

use crate::request_context::RequestContext;

/// One recorded change to the execution context.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextChange {
    /// State keys written by a step (merged key by key).
    State(Map<String, Value>),
    /// A step suspended at `path`.
    Suspended { step_id: String, path: Vec<usize> },
    /// A suspended step was resumed; its suspension and labels are cleared.
    Resumed { step_id: String },
    /// A resume label now points at `path`.
    Label { label: String, path: Vec<usize> },
    /// A step started running at `path`.
    Active { step_id: String, path: Vec<usize> },
    /// A step settled.
    Inactive { step_id: String },
}

/// Ordered change log of one entry execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextDelta {
    changes: Vec<ContextChange>,
}

impl ContextDelta {
    pub fn push(&mut self, change: ContextChange) {
        self.changes.push(change);
    }

    /// Append another delta after this one.
    pub fn extend(&mut self, other: ContextDelta) {
        self.changes.extend(other.changes);
    }

    pub fn changes(&self) -> &[ContextChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Apply every change, in order.
    pub fn apply(&self, ctx: &mut ExecutionContext) {
        for change in &self.changes {
            match change {
                ContextChange::State(updates) => {
                    for (key, value) in updates {
                        ctx.state.insert(key.clone(), value.clone());
                    }
                }
                ContextChange::Suspended { step_id, path } => {
                    ctx.suspended_paths.insert(step_id.clone(), path.clone());
                }
                ContextChange::Resumed { step_id } => {
                    if let Some(path) = ctx.suspended_paths.remove(step_id) {
                        ctx.resume_labels.retain(|_, target| *target != path);
                    }
                }
                ContextChange::Label { label, path } => {
                    ctx.resume_labels.insert(label.clone(), path.clone());
                }
                ContextChange::Active { step_id, path } => {
                    ctx.active_steps_path.insert(step_id.clone(), path.clone());
                }
                ContextChange::Inactive { step_id } => {
                    ctx.active_steps_path.remove(step_id);
                }
            }
        }
    }
}

/// Result of executing one flow entry.
#[derive(Debug, Clone)]
pub struct EntryOutcome {
    /// The entry's settled result.
    pub result: StepResult,
    /// Step results written by the entry and its children.
    pub step_results: IndexMap<String, StepResult>,
    pub delta: ContextDelta,
    pub request_context: RequestContext,
    /// A step asked to end the run early with `result.output`.
    pub bailed: bool,
}

impl EntryOutcome {
    pub(crate) fn new(result: StepResult, request_context: RequestContext) -> Self {
        Self {
            result,
            step_results: IndexMap::new(),
            delta: ContextDelta::default(),
            request_context,
            bailed: false,
        }
    }

    /// Fold a child's writes and changes into this outcome.
    pub(crate) fn absorb(&mut self, child: EntryOutcome) {
        self.step_results.extend(child.step_results);
        self.delta.extend(child.delta);
        self.bailed |= child.bailed;
    }
}

/// `base` with `writes` layered on top.
pub(crate) fn overlay(base: &StepResults, writes: &IndexMap<String, StepResult>) -> StepResults {
    let mut merged = base.clone();
    for (id, result) in writes {
        merged.insert(id.clone(), result.clone());
    }
    merged
}
