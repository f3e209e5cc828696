//! Watch events published for live observation of a workflow run.
//!
//! Every event travels on the per-run channel returned by [`run_channel`]
//! with the wire shape
//! `{ "type": "watch", "runId": ..., "data": { "type": <event>, "payload": {...} } }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope type of every watch event.
pub const WATCH_EVENT_KIND: &str = "watch";

/// Pub/sub channel carrying the watch events of `run_id`.
pub fn run_channel(run_id: &str) -> String {
    format!("workflow.events.v2.{run_id}")
}

/// Lifecycle notifications emitted during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowEventType {
    WorkflowStart,
    WorkflowStepStart,
    WorkflowStepWaiting,
    WorkflowStepResult,
    WorkflowStepSuspended,
    WorkflowStepFinish,
    WorkflowCanceled,
    WorkflowFinish,
}

impl WorkflowEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowEventType::WorkflowStart => "workflow-start",
            WorkflowEventType::WorkflowStepStart => "workflow-step-start",
            WorkflowEventType::WorkflowStepWaiting => "workflow-step-waiting",
            WorkflowEventType::WorkflowStepResult => "workflow-step-result",
            WorkflowEventType::WorkflowStepSuspended => "workflow-step-suspended",
            WorkflowEventType::WorkflowStepFinish => "workflow-step-finish",
            WorkflowEventType::WorkflowCanceled => "workflow-canceled",
            WorkflowEventType::WorkflowFinish => "workflow-finish",
        }
    }
}

/// Inner part of a watch event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEventData {
    #[serde(rename = "type")]
    pub event_type: WorkflowEventType,
    pub payload: Value,
}

/// A watch event as published on the run channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub run_id: String,
    pub data: WatchEventData,
}

impl WatchEvent {
    pub fn new(run_id: impl Into<String>, event_type: WorkflowEventType, payload: Value) -> Self {
        Self {
            kind: WATCH_EVENT_KIND.to_string(),
            run_id: run_id.into(),
            data: WatchEventData {
                event_type,
                payload,
            },
        }
    }

    pub fn event_type(&self) -> WorkflowEventType {
        self.data.event_type
    }
}
