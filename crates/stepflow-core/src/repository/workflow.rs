//! Workflow store trait definition.
//!
//! Defines the storage interface for workflow run snapshots and for the
//! recorded results of durable operations. The infrastructure layer
//! (stepflow-infra) implements this trait with SQLite persistence.

use serde_json::Value;
use stepflow_types::error::StoreError;
use stepflow_types::snapshot::{PersistSnapshotParams, WorkflowRunRecord, WorkflowSnapshot};

/// Store trait for workflow persistence.
///
/// Covers two entity families:
/// - **Snapshots:** one latest-state document per `(workflow name, run id)`,
///   overwritten on every write.
/// - **Durable operations:** the recorded result of each completed
///   side-effecting operation, keyed by its deterministic operation id.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync + 'static {
    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Insert or overwrite the snapshot of a run.
    fn persist_workflow_snapshot(
        &self,
        params: PersistSnapshotParams,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Load the latest snapshot of a run.
    fn load_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowSnapshot>, StoreError>> + Send;

    /// List the runs of a workflow, most recently updated first.
    fn list_workflow_runs(
        &self,
        workflow_name: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRunRecord>, StoreError>> + Send;

    /// Delete the snapshot of a run. Returns `true` if it existed.
    fn delete_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Durable operations
    // -----------------------------------------------------------------------

    /// Recorded result of a completed operation, if any.
    fn load_operation_result(
        &self,
        operation_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// Record the result of a completed operation.
    fn save_operation_result(
        &self,
        operation_id: &str,
        result: &Value,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Forget every recorded operation whose id starts with `prefix`.
    /// Returns the number of records removed.
    fn clear_operation_results(
        &self,
        prefix: &str,
    ) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;
}
