//! Durable operation wrapper.
//!
//! Side-effecting engine operations (snapshot writes, event publishes around
//! sleeps) run through [`DurableOperations::wrap`] under a deterministic
//! operation id. The first completion's result is recorded in the
//! [`WorkflowStore`]; re-running an operation with a recorded result returns
//! the recorded value instead of executing it again. Operations sharing an
//! id are serialized by a per-id lock.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::error::EngineError;
use crate::repository::workflow::WorkflowStore;

/// Deterministic id of an operation performed at `path` within a run.
///
/// `workflow.<workflowId>.run.<runId>.path.<p0-p1-...>.<operation>`
pub fn operation_id(workflow_id: &str, run_id: &str, path: &[usize], operation: &str) -> String {
    format!("{}{}.{operation}", run_prefix(workflow_id, run_id), path_key(path))
}

/// Qualify `operation` with the loop iterations enclosing it.
///
/// An entry inside a loop body runs at the same path on every iteration;
/// `iter.<i0-i1-...>.` keeps each iteration's operations distinct.
pub fn scoped_operation(iterations: &[u32], operation: &str) -> String {
    if iterations.is_empty() {
        return operation.to_string();
    }
    let scope = iterations.iter().map(u32::to_string).collect::<Vec<_>>().join("-");
    format!("iter.{scope}.{operation}")
}

/// Prefix shared by every operation id of a run.
pub fn run_prefix(workflow_id: &str, run_id: &str) -> String {
    format!("workflow.{workflow_id}.run.{run_id}.path.")
}

fn path_key(path: &[usize]) -> String {
    if path.is_empty() {
        return "root".to_string();
    }
    path.iter().map(usize::to_string).collect::<Vec<_>>().join("-")
}

// ---------------------------------------------------------------------------
// DurableOperations
// ---------------------------------------------------------------------------

/// Records and replays operation results through a [`WorkflowStore`].
pub struct DurableOperations<S: WorkflowStore> {
    store: Arc<S>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: WorkflowStore> DurableOperations<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    /// Run `operation` at most once per `operation_id`.
    pub async fn wrap<T, F, Fut>(&self, operation_id: &str, operation: F) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let lock = self
            .locks
            .entry(operation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(recorded) = self.store.load_operation_result(operation_id).await? {
            tracing::debug!(operation_id, "durable operation already completed; replaying result");
            return Ok(serde_json::from_value(recorded)?);
        }

        let value = operation().await?;
        self.store
            .save_operation_result(operation_id, &serde_json::to_value(&value)?)
            .await?;
        Ok(value)
    }

    /// Forget every recorded operation of a run, so the next execution of
    /// any path performs its operations again.
    pub async fn forget_run(&self, workflow_id: &str, run_id: &str) -> Result<(), EngineError> {
        let prefix = run_prefix(workflow_id, run_id);
        let removed = self.store.clear_operation_results(&prefix).await?;
        self.release_locks(workflow_id, run_id);
        tracing::debug!(workflow_id, run_id, removed, "cleared durable operation records");
        Ok(())
    }

    /// Drop the in-process locks of a run that is no longer executing.
    pub fn release_locks(&self, workflow_id: &str, run_id: &str) {
        let prefix = run_prefix(workflow_id, run_id);
        self.locks.retain(|id, _| !id.starts_with(&prefix));
    }
}
