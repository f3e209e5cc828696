//! Snapshot persistence for step updates.
//!
//! [`SnapshotPersister`] builds the [`WorkflowSnapshot`] document from the
//! run's current step results and execution context and writes it through
//! the durable operation wrapper, so a replayed update at the same path and
//! status is written only once. A per-workflow gate, or the engine's
//! [`SnapshotPolicy`], may skip a write entirely.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use stepflow_types::config::SnapshotPolicy;
use stepflow_types::error::SerializedError;
use stepflow_types::snapshot::{PersistSnapshotParams, WorkflowSnapshot};
use stepflow_types::workflow::{ExecutionContext, SerializedStepFlowEntry, StepResults, WorkflowRunStatus};

use super::durable::{DurableOperations, operation_id, scoped_operation};
use super::error::EngineError;
use crate::repository::workflow::WorkflowStore;
use crate::request_context::RequestContext;

/// What a persistence gate gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct PersistGate<'a> {
    pub step_results: &'a StepResults,
    pub workflow_status: WorkflowRunStatus,
}

/// Predicate deciding whether a step update is persisted.
pub type ShouldPersistSnapshot = Arc<dyn Fn(&PersistGate<'_>) -> bool + Send + Sync>;

/// One step update to persist.
pub struct StepUpdate<'a> {
    pub workflow_id: &'a str,
    pub run_id: &'a str,
    pub resource_id: Option<&'a str>,
    pub serialized_graph: &'a [SerializedStepFlowEntry],
    pub step_results: &'a StepResults,
    pub context: &'a ExecutionContext,
    pub workflow_status: WorkflowRunStatus,
    pub result: Option<Value>,
    pub error: Option<SerializedError>,
    pub request_context: &'a RequestContext,
    /// Path of the entry that produced this update.
    pub path: &'a [usize],
    /// Loop iterations enclosing that entry, outermost first.
    pub iterations: &'a [u32],
    pub gate: Option<&'a ShouldPersistSnapshot>,
}

impl StepUpdate<'_> {
    fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            run_id: self.run_id.to_string(),
            status: self.workflow_status,
            value: self.context.state.clone(),
            context: self.step_results.clone(),
            active_paths: self.path.to_vec(),
            active_steps_path: self.context.active_steps_path.clone(),
            serialized_step_graph: self.serialized_graph.to_vec(),
            suspended_paths: self.context.suspended_paths.clone(),
            resume_labels: self.context.resume_labels.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            request_context: self.request_context.to_json_map(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

// ---------------------------------------------------------------------------
// SnapshotPersister
// ---------------------------------------------------------------------------

/// Writes step updates to the [`WorkflowStore`].
pub struct SnapshotPersister<S: WorkflowStore> {
    store: Arc<S>,
    durable: Arc<DurableOperations<S>>,
    policy: SnapshotPolicy,
}

impl<S: WorkflowStore> SnapshotPersister<S> {
    pub fn new(store: Arc<S>, durable: Arc<DurableOperations<S>>, policy: SnapshotPolicy) -> Self {
        Self { store, durable, policy }
    }

    fn should_persist(&self, update: &StepUpdate<'_>) -> bool {
        let gate = PersistGate {
            step_results: update.step_results,
            workflow_status: update.workflow_status,
        };
        match update.gate {
            Some(gate_fn) => gate_fn(&gate),
            None => match self.policy {
                SnapshotPolicy::Always => true,
                SnapshotPolicy::OnStatusChange => update.workflow_status != WorkflowRunStatus::Running,
            },
        }
    }

    /// Persist one step update. Returns whether a write was attempted.
    pub async fn persist_step_update(&self, update: StepUpdate<'_>) -> Result<bool, EngineError> {
        if !self.should_persist(&update) {
            tracing::trace!(
                run_id = update.run_id,
                status = update.workflow_status.as_str(),
                "snapshot write skipped by gate"
            );
            return Ok(false);
        }

        let op_id = operation_id(
            update.workflow_id,
            update.run_id,
            update.path,
            &scoped_operation(
                update.iterations,
                &format!("stepUpdate.{}", update.workflow_status.as_str()),
            ),
        );
        let params = PersistSnapshotParams {
            workflow_name: update.workflow_id.to_string(),
            run_id: update.run_id.to_string(),
            resource_id: update.resource_id.map(str::to_string),
            snapshot: update.snapshot(),
        };

        self.durable
            .wrap(&op_id, || async move {
                self.store.persist_workflow_snapshot(params).await?;
                Ok(())
            })
            .await?;

        tracing::debug!(
            run_id = update.run_id,
            path = ?update.path,
            status = update.workflow_status.as_str(),
            "persisted step update"
        );
        Ok(true)
    }
}
