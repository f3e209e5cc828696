//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `stepflow-core` using sqlx with split
//! read/write pools. Each run keeps one row in `workflow_snapshots` holding
//! the snapshot document as JSON; durable operation results live in
//! `durable_operations` keyed by operation id.

use serde_json::Value;
use sqlx::Row;
use stepflow_core::repository::workflow::WorkflowStore;
use stepflow_types::error::StoreError;
use stepflow_types::snapshot::{PersistSnapshotParams, WorkflowRunRecord, WorkflowSnapshot};
use stepflow_types::workflow::WorkflowRunStatus;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStore`.
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct SnapshotRow {
    snapshot: String,
}

impl SnapshotRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            snapshot: row.try_get("snapshot")?,
        })
    }

    fn into_snapshot(self) -> Result<WorkflowSnapshot, StoreError> {
        serde_json::from_str(&self.snapshot)
            .map_err(|e| StoreError::Serialization(format!("invalid snapshot JSON: {e}")))
    }
}

struct RunRow {
    workflow_name: String,
    run_id: String,
    resource_id: Option<String>,
    status: String,
    updated_at: i64,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_name: row.try_get("workflow_name")?,
            run_id: row.try_get("run_id")?,
            resource_id: row.try_get("resource_id")?,
            status: row.try_get("status")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<WorkflowRunRecord, StoreError> {
        Ok(WorkflowRunRecord {
            status: parse_status(&self.status)?,
            workflow_name: self.workflow_name,
            run_id: self.run_id,
            resource_id: self.resource_id,
            updated_at: self.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_status(s: &str) -> Result<WorkflowRunStatus, StoreError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| StoreError::Serialization(format!("invalid run status: {s}")))
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn persist_workflow_snapshot(&self, params: PersistSnapshotParams) -> Result<(), StoreError> {
        let snapshot_json = serde_json::to_string(&params.snapshot)
            .map_err(|e| StoreError::Serialization(format!("serialize snapshot: {e}")))?;
        let timestamp = params.snapshot.timestamp;

        sqlx::query(
            r#"INSERT INTO workflow_snapshots
               (workflow_name, run_id, resource_id, status, snapshot, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_name, run_id) DO UPDATE SET
                 resource_id = COALESCE(excluded.resource_id, workflow_snapshots.resource_id),
                 status = excluded.status,
                 snapshot = excluded.snapshot,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&params.workflow_name)
        .bind(&params.run_id)
        .bind(&params.resource_id)
        .bind(params.snapshot.status.as_str())
        .bind(&snapshot_json)
        .bind(timestamp)
        .bind(timestamp)
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn load_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
    ) -> Result<Option<WorkflowSnapshot>, StoreError> {
        let row = sqlx::query("SELECT snapshot FROM workflow_snapshots WHERE workflow_name = ? AND run_id = ?")
            .bind(workflow_name)
            .bind(run_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(backend)?;

        match row {
            Some(row) => {
                let r = SnapshotRow::from_row(&row).map_err(backend)?;
                Ok(Some(r.into_snapshot()?))
            }
            None => Ok(None),
        }
    }

    async fn list_workflow_runs(&self, workflow_name: &str) -> Result<Vec<WorkflowRunRecord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT workflow_name, run_id, resource_id, status, updated_at
               FROM workflow_snapshots
               WHERE workflow_name = ?
               ORDER BY updated_at DESC, run_id ASC"#,
        )
        .bind(workflow_name)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(backend)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(backend)?;
            runs.push(r.into_record()?);
        }
        Ok(runs)
    }

    async fn delete_workflow_snapshot(&self, workflow_name: &str, run_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM workflow_snapshots WHERE workflow_name = ? AND run_id = ?")
            .bind(workflow_name)
            .bind(run_id)
            .execute(&self.pool.writer)
            .await
            .map_err(backend)?;

        Ok(result.rows_affected() > 0)
    }

    async fn load_operation_result(&self, operation_id: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT result FROM durable_operations WHERE operation_id = ?")
            .bind(operation_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(backend)?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("result").map_err(backend)?;
                let value = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Serialization(format!("invalid operation result: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn save_operation_result(&self, operation_id: &str, result: &Value) -> Result<(), StoreError> {
        let raw = serde_json::to_string(result)
            .map_err(|e| StoreError::Serialization(format!("serialize operation result: {e}")))?;

        sqlx::query(
            r#"INSERT INTO durable_operations (operation_id, result, created_at)
               VALUES (?, ?, ?)
               ON CONFLICT(operation_id) DO UPDATE SET
                 result = excluded.result"#,
        )
        .bind(operation_id)
        .bind(&raw)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn clear_operation_results(&self, prefix: &str) -> Result<u64, StoreError> {
        // LIKE would treat `_` in run ids as a wildcard.
        let result = sqlx::query("DELETE FROM durable_operations WHERE substr(operation_id, 1, length(?)) = ?")
            .bind(prefix)
            .bind(prefix)
            .execute(&self.pool.writer)
            .await
            .map_err(backend)?;

        tracing::debug!(prefix, removed = result.rows_affected(), "cleared durable operation results");
        Ok(result.rows_affected())
    }
}
