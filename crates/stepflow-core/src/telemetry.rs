//! Error tracking sink.
//!
//! The engine reports recoverable framework errors (a conditional predicate
//! that failed, a snapshot write that failed) to a [`TrackingSink`] in
//! addition to logging them.

use std::sync::{Mutex, PoisonError};

use stepflow_types::error::DomainError;

/// Receives framework errors worth reporting to an error tracker.
pub trait TrackingSink: Send + Sync {
    fn track_exception(&self, error: &DomainError);
}

/// Default sink: forwards every tracked error to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TrackingSink for TracingSink {
    fn track_exception(&self, error: &DomainError) {
        tracing::error!(
            error_id = %error.id,
            domain = ?error.domain,
            category = ?error.category,
            cause = ?error.cause().map(|c| c.to_string()),
            "{error}"
        );
    }
}

/// Sink that keeps every tracked error in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    errors: Mutex<Vec<DomainError>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors tracked so far, in order.
    pub fn errors(&self) -> Vec<DomainError> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TrackingSink for RecordingSink {
    fn track_exception(&self, error: &DomainError) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error.clone());
    }
}
