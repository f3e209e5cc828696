//! Error types shared across the stepflow crates.
//!
//! [`DomainError`] is the framework's structured error (stable id, domain,
//! category, details, optional cause). [`SerializedError`] is its
//! storage-safe projection, recorded in step results and snapshots.
//! [`StoreError`] and [`PubSubError`] are returned by the storage and
//! pub/sub port traits.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Id of the domain error raised when a conditional predicate fails.
pub const WORKFLOW_CONDITION_EVALUATION_FAILED: &str = "WORKFLOW_CONDITION_EVALUATION_FAILED";

/// Id of the domain error recorded when a snapshot write fails mid-run.
pub const WORKFLOW_SNAPSHOT_PERSIST_FAILED: &str = "WORKFLOW_SNAPSHOT_PERSIST_FAILED";

// ---------------------------------------------------------------------------
// DomainError
// ---------------------------------------------------------------------------

/// Subsystem an error originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorDomain {
    Workflow,
    Storage,
    Step,
}

/// Who is at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    User,
    System,
    ThirdParty,
    Unknown,
}

/// Structured framework error.
///
/// Cloneable (the cause is reference counted) so the same error can be
/// logged, reported to a tracking sink and returned.
#[derive(Clone)]
pub struct DomainError {
    pub id: String,
    pub domain: ErrorDomain,
    pub category: ErrorCategory,
    pub text: String,
    pub details: Map<String, Value>,
    cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl DomainError {
    pub fn new(
        id: impl Into<String>,
        domain: ErrorDomain,
        category: ErrorCategory,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            domain,
            category,
            text: text.into(),
            details: Map::new(),
            cause: None,
        }
    }

    /// Attach a detail field.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attach the underlying error.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Attach an already shared underlying error.
    pub fn with_shared_cause(mut self, cause: Arc<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        self.cause = Some(cause);
        self
    }

    /// The underlying error, if any.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// The underlying error, downcast to a concrete domain error.
    pub fn domain_cause(&self) -> Option<&DomainError> {
        self.cause()?.downcast_ref::<DomainError>()
    }

    pub fn to_serialized(&self) -> SerializedError {
        let mut serialized = SerializedError::from_error(self);
        serialized.name = "DomainError".to_string();
        serialized.id = Some(self.id.clone());
        serialized
    }
}

impl fmt::Debug for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainError")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("category", &self.category)
            .field("text", &self.text)
            .field("details", &self.details)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl std::error::Error for DomainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// SerializedError
// ---------------------------------------------------------------------------

/// Storage-safe error projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<SerializedError>>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            id: None,
            cause: None,
        }
    }

    /// Project any error, following its `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let id = err.downcast_ref::<DomainError>().map(|d| d.id.clone());
        Self {
            name: if id.is_some() { "DomainError" } else { "Error" }.to_string(),
            message: err.to_string(),
            id,
            cause: err.source().map(|source| Box::new(Self::from_error(source))),
        }
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

// ---------------------------------------------------------------------------
// Port errors
// ---------------------------------------------------------------------------

/// Errors from snapshot storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors from pub/sub operations.
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("pubsub channel closed: {0}")]
    Closed(String),

    #[error("pubsub backend error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_error_keeps_cause_chain() {
        let inner = DomainError::new("INNER", ErrorDomain::Step, ErrorCategory::User, "inner failed");
        let outer = DomainError::new(
            WORKFLOW_CONDITION_EVALUATION_FAILED,
            ErrorDomain::Workflow,
            ErrorCategory::User,
            "condition failed",
        )
        .with_detail("runId", "run-1")
        .with_cause(inner);

        assert_eq!(outer.to_string(), "condition failed");
        assert_eq!(outer.domain_cause().unwrap().id, "INNER");
        assert_eq!(outer.details["runId"], Value::String("run-1".into()));

        let serialized = outer.to_serialized();
        assert_eq!(serialized.id.as_deref(), Some(WORKFLOW_CONDITION_EVALUATION_FAILED));
        let cause = serialized.cause.unwrap();
        assert_eq!(cause.id.as_deref(), Some("INNER"));
        assert_eq!(cause.message, "inner failed");
    }

    #[test]
    fn serialized_error_from_plain_error() {
        let err = StoreError::Backend("disk full".to_string());
        let serialized = SerializedError::from_error(&err);
        assert_eq!(serialized.name, "Error");
        assert!(serialized.message.contains("disk full"));
        assert!(serialized.id.is_none());
        assert!(serialized.cause.is_none());
    }

    #[test]
    fn store_error_display() {
        let err = StoreError::NotFound("run-9".to_string());
        assert!(err.to_string().contains("run-9"));
        let err = PubSubError::Closed("workflow.events.v2.run-9".to_string());
        assert!(err.to_string().contains("closed"));
    }
}
