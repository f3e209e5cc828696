//! In-memory `WorkflowStore`.
//!
//! Backed by `DashMap`s. Suitable for tests and for embedders that do not
//! need runs to survive a process restart. Counts snapshot writes so callers
//! can assert on persistence behavior.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use stepflow_types::error::StoreError;
use stepflow_types::snapshot::{PersistSnapshotParams, WorkflowRunRecord, WorkflowSnapshot};

use super::workflow::WorkflowStore;

#[derive(Debug, Clone)]
struct StoredSnapshot {
    resource_id: Option<String>,
    snapshot: WorkflowSnapshot,
}

/// Process-local snapshot store.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    snapshots: DashMap<(String, String), StoredSnapshot>,
    operations: DashMap<String, Value>,
    snapshot_writes: AtomicUsize,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of snapshot writes accepted so far.
    pub fn snapshot_writes(&self) -> usize {
        self.snapshot_writes.load(Ordering::SeqCst)
    }

    /// Number of recorded durable operation results.
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    async fn persist_workflow_snapshot(&self, params: PersistSnapshotParams) -> Result<(), StoreError> {
        let key = (params.workflow_name, params.run_id);
        let resource_id = params
            .resource_id
            .or_else(|| self.snapshots.get(&key).and_then(|stored| stored.resource_id.clone()));
        self.snapshots.insert(
            key,
            StoredSnapshot {
                resource_id,
                snapshot: params.snapshot,
            },
        );
        self.snapshot_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
    ) -> Result<Option<WorkflowSnapshot>, StoreError> {
        Ok(self
            .snapshots
            .get(&(workflow_name.to_string(), run_id.to_string()))
            .map(|stored| stored.snapshot.clone()))
    }

    async fn list_workflow_runs(&self, workflow_name: &str) -> Result<Vec<WorkflowRunRecord>, StoreError> {
        let mut runs: Vec<WorkflowRunRecord> = self
            .snapshots
            .iter()
            .filter(|entry| entry.key().0 == workflow_name)
            .map(|entry| WorkflowRunRecord {
                workflow_name: entry.key().0.clone(),
                run_id: entry.key().1.clone(),
                resource_id: entry.value().resource_id.clone(),
                status: entry.value().snapshot.status,
                updated_at: entry.value().snapshot.timestamp,
            })
            .collect();
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.run_id.cmp(&b.run_id)));
        Ok(runs)
    }

    async fn delete_workflow_snapshot(&self, workflow_name: &str, run_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .snapshots
            .remove(&(workflow_name.to_string(), run_id.to_string()))
            .is_some())
    }

    async fn load_operation_result(&self, operation_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.operations.get(operation_id).map(|v| v.clone()))
    }

    async fn save_operation_result(&self, operation_id: &str, result: &Value) -> Result<(), StoreError> {
        self.operations.insert(operation_id.to_string(), result.clone());
        Ok(())
    }

    async fn clear_operation_results(&self, prefix: &str) -> Result<u64, StoreError> {
        let before = self.operations.len();
        self.operations.retain(|id, _| !id.starts_with(prefix));
        Ok((before - self.operations.len()) as u64)
    }
}
