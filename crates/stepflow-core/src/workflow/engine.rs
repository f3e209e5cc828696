//! Workflow execution engine.
//!
//! [`WorkflowEngine`] owns the lifecycle of runs: it starts them, drives the
//! top-level entries in order, persists a snapshot after every settled
//! entry, and publishes run-level events. Runs stopped at a suspension, a
//! crash or a finished state are picked up again through [`resume`],
//! [`restart`] and [`time_travel`].
//!
//! [`resume`]: WorkflowEngine::resume
//! [`restart`]: WorkflowEngine::restart
//! [`time_travel`]: WorkflowEngine::time_travel

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value, json};
use stepflow_types::config::EngineConfig;
use stepflow_types::error::{
    DomainError, ErrorCategory, ErrorDomain, SerializedError, WORKFLOW_SNAPSHOT_PERSIST_FAILED,
};
use stepflow_types::event::{WatchEvent, WorkflowEventType, run_channel};
use stepflow_types::snapshot::{PersistSnapshotParams, WorkflowRunRecord, WorkflowSnapshot};
use stepflow_types::workflow::{
    ExecutionContext, RetryConfig, StepResult, StepResults, StepStatus, WorkflowRunStatus, locate_step,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::builder::Workflow;
use super::durable::DurableOperations;
use super::error::EngineError;
use super::executor::{EntryExecutor, EntryParams, ResumeParams, RunScope, TimeTravelParams};
use super::graph::{StepFlowEntry, previous_output};
use super::persist::{SnapshotPersister, StepUpdate};
use crate::event::{EventPublisher, PubSub};
use crate::repository::workflow::WorkflowStore;
use crate::request_context::RequestContext;
use crate::telemetry::TrackingSink;

// ---------------------------------------------------------------------------
// Options and outcome
// ---------------------------------------------------------------------------

/// Options for [`WorkflowEngine::start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Run id to use; a UUIDv7 is generated when absent.
    pub run_id: Option<String>,
    pub input: Value,
    pub initial_state: Map<String, Value>,
    pub resource_id: Option<String>,
    pub request_context: Option<RequestContext>,
}

impl StartOptions {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn initial_state(mut self, state: Map<String, Value>) -> Self {
        self.initial_state = state;
        self
    }

    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn request_context(mut self, request_context: RequestContext) -> Self {
        self.request_context = Some(request_context);
        self
    }
}

/// Which suspended step a resume is aimed at.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ResumeTarget {
    /// The first suspended step (by step id).
    #[default]
    Auto,
    Step(String),
    Label(String),
    /// Explicit execution path, e.g. `[1, 0]` or a foreach item `[2, 3]`.
    Path(Vec<usize>),
}

/// Options for [`WorkflowEngine::resume`].
#[derive(Debug, Clone)]
pub struct ResumeOptions {
    pub run_id: String,
    pub target: ResumeTarget,
    pub resume_data: Value,
    /// Replaces the request context restored from the snapshot.
    pub request_context: Option<RequestContext>,
}

impl ResumeOptions {
    pub fn new(run_id: impl Into<String>, resume_data: Value) -> Self {
        Self {
            run_id: run_id.into(),
            target: ResumeTarget::Auto,
            resume_data,
            request_context: None,
        }
    }

    pub fn step(mut self, step_id: impl Into<String>) -> Self {
        self.target = ResumeTarget::Step(step_id.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.target = ResumeTarget::Label(label.into());
        self
    }

    pub fn path(mut self, path: Vec<usize>) -> Self {
        self.target = ResumeTarget::Path(path);
        self
    }

    pub fn request_context(mut self, request_context: RequestContext) -> Self {
        self.request_context = Some(request_context);
        self
    }
}

/// Options for [`WorkflowEngine::time_travel`].
#[derive(Debug, Clone)]
pub struct TimeTravelOptions {
    pub run_id: String,
    pub step_id: String,
    /// New input for the target step; its recorded input is reused otherwise.
    pub input: Option<Value>,
    pub request_context: Option<RequestContext>,
}

impl TimeTravelOptions {
    pub fn new(run_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            step_id: step_id.into(),
            input: None,
            request_context: None,
        }
    }

    pub fn input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// What a start, resume, restart or time travel ended with.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: WorkflowRunStatus,
    /// Run output on `success`.
    pub result: Option<Value>,
    pub error: Option<SerializedError>,
    pub steps: StepResults,
    pub state: Map<String, Value>,
    /// Suspended step ids and their paths.
    pub suspended: BTreeMap<String, Vec<usize>>,
}

impl RunOutcome {
    /// Step result by id.
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.get(step_id)
    }
}

/// Mutable state of one drive through the graph.
struct RunState<'w> {
    scope: RunScope<'w>,
    results: StepResults,
    context: ExecutionContext,
    start_index: usize,
    resume: Option<ResumeParams>,
    time_travel: Option<TimeTravelParams>,
    restart: bool,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Runs workflows against a [`WorkflowStore`] and a [`PubSub`].
///
/// Must be created inside a tokio runtime: construction spawns the event
/// publishing task.
pub struct WorkflowEngine<S: WorkflowStore, P: PubSub> {
    store: Arc<S>,
    pubsub: Arc<P>,
    durable: Arc<DurableOperations<S>>,
    persister: Arc<SnapshotPersister<S>>,
    executor: EntryExecutor<S>,
    publisher: EventPublisher,
    tracker: Arc<dyn TrackingSink>,
    runs: DashMap<String, CancellationToken>,
    config: EngineConfig,
}

impl<S: WorkflowStore, P: PubSub> WorkflowEngine<S, P> {
    pub fn new(store: Arc<S>, pubsub: Arc<P>, tracker: Arc<dyn TrackingSink>, config: EngineConfig) -> Self {
        let durable = Arc::new(DurableOperations::new(store.clone()));
        let persister = Arc::new(SnapshotPersister::new(
            store.clone(),
            durable.clone(),
            config.snapshots.policy,
        ));
        let publisher = EventPublisher::spawn(pubsub.clone(), config.event_queue_capacity);
        let executor = EntryExecutor::new(
            persister.clone(),
            durable.clone(),
            publisher.clone(),
            tracker.clone(),
            config.foreach_concurrency,
        );
        Self {
            store,
            pubsub,
            durable,
            persister,
            executor,
            publisher,
            tracker,
            runs: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a run is currently executing in this engine.
    pub fn is_active(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Start a new run and drive it until it settles.
    pub async fn start(&self, workflow: &Workflow, options: StartOptions) -> Result<RunOutcome, EngineError> {
        if let Some(schema) = workflow.input_validator() {
            schema
                .validate(&options.input)
                .map_err(|violations| EngineError::InvalidInput(violations.join("; ")))?;
        }

        let run_id = options
            .run_id
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let abort = self.register(&run_id)?;
        let retry = workflow.retry_config().unwrap_or(self.config.retry);

        tracing::info!(workflow_id = workflow.id(), run_id = %run_id, "starting workflow run");
        self.emit(&run_id, WorkflowEventType::WorkflowStart, json!({ "runId": run_id }))
            .await;

        let state = RunState {
            context: ExecutionContext::new(workflow.id(), &run_id, retry, options.initial_state),
            results: StepResults::new(options.input),
            scope: RunScope {
                workflow,
                run_id,
                resource_id: options.resource_id,
                abort,
                request_context: options.request_context.unwrap_or_default(),
            },
            start_index: 0,
            resume: None,
            time_travel: None,
            restart: false,
        };
        self.drive(state).await
    }

    /// Resume a suspended run at one of its suspended steps.
    pub async fn resume(&self, workflow: &Workflow, options: ResumeOptions) -> Result<RunOutcome, EngineError> {
        let snapshot = self.load(workflow, &options.run_id).await?;
        if snapshot.status != WorkflowRunStatus::Suspended {
            return Err(EngineError::InvalidRunStatus {
                run_id: options.run_id,
                status: snapshot.status,
                expected: "suspended",
            });
        }
        if self.is_active(&options.run_id) {
            return Err(EngineError::RunActive { run_id: options.run_id });
        }

        let (step_id, path) = resolve_resume_target(workflow, &snapshot, &options.target)?;
        let label = match &options.target {
            ResumeTarget::Label(label) => Some(label.clone()),
            _ => None,
        };

        self.durable.forget_run(workflow.id(), &options.run_id).await?;
        let abort = self.register(&options.run_id)?;

        tracing::info!(
            workflow_id = workflow.id(),
            run_id = %options.run_id,
            step_id = %step_id,
            path = ?path,
            "resuming workflow run"
        );
        self.emit(
            &options.run_id,
            WorkflowEventType::WorkflowStart,
            json!({ "runId": options.run_id, "resumed": step_id }),
        )
        .await;

        let mut context = restore_context(workflow, &snapshot, self.config.retry);
        context.resume_labels.retain(|_, target| *target != path);
        let request_context = options
            .request_context
            .unwrap_or_else(|| RequestContext::from_json_map(snapshot.request_context.clone()));

        let state = RunState {
            scope: RunScope {
                workflow,
                run_id: options.run_id,
                resource_id: None,
                abort,
                request_context,
            },
            results: snapshot.context,
            context,
            start_index: path[0],
            resume: Some(ResumeParams {
                step_id,
                path: path[1..].to_vec(),
                resume_data: options.resume_data,
                label,
            }),
            time_travel: None,
            restart: false,
        };
        self.drive(state).await
    }

    /// Re-enter a run whose process stopped while it was `running` or
    /// `waiting`. Settled entries are skipped; recorded durable operations
    /// are replayed rather than repeated.
    pub async fn restart(&self, workflow: &Workflow, run_id: &str) -> Result<RunOutcome, EngineError> {
        let snapshot = self.load(workflow, run_id).await?;
        if !matches!(
            snapshot.status,
            WorkflowRunStatus::Running | WorkflowRunStatus::Waiting
        ) {
            return Err(EngineError::InvalidRunStatus {
                run_id: run_id.to_string(),
                status: snapshot.status,
                expected: "running or waiting",
            });
        }
        let abort = self.register(run_id)?;

        let graph = workflow.graph();
        let mut start_index = snapshot.active_paths.first().copied().unwrap_or(0);
        if start_index < graph.len() && entry_settled(&graph[start_index], &snapshot.context) {
            start_index += 1;
        }
        tracing::info!(
            workflow_id = workflow.id(),
            run_id,
            start_index,
            status = snapshot.status.as_str(),
            "restarting workflow run"
        );

        let mut context = restore_context(workflow, &snapshot, self.config.retry);
        context.active_steps_path.clear();

        let state = RunState {
            scope: RunScope {
                workflow,
                run_id: run_id.to_string(),
                resource_id: None,
                abort,
                request_context: RequestContext::from_json_map(snapshot.request_context.clone()),
            },
            results: snapshot.context,
            context,
            start_index,
            resume: None,
            time_travel: None,
            restart: true,
        };
        self.drive(state).await
    }

    /// Re-execute a run from `step_id`, discarding the results of that step
    /// and of everything after it.
    pub async fn time_travel(&self, workflow: &Workflow, options: TimeTravelOptions) -> Result<RunOutcome, EngineError> {
        let snapshot = self.load(workflow, &options.run_id).await?;
        if self.is_active(&options.run_id) {
            return Err(EngineError::RunActive { run_id: options.run_id });
        }
        let path = locate_step(workflow.serialized_graph(), &options.step_id)
            .ok_or_else(|| EngineError::UnknownStep(options.step_id.clone()))?;

        let mut results = snapshot.context.clone();
        let serialized = workflow.serialized_graph();
        for entry in &serialized[path[0] + 1..] {
            for id in entry.result_ids() {
                results.remove(&id);
            }
        }
        if path.len() == 1 {
            for id in serialized[path[0]].result_ids() {
                results.remove(&id);
            }
        } else {
            results.remove(&options.step_id);
        }

        let mut context = restore_context(workflow, &snapshot, self.config.retry);
        context.active_steps_path.clear();
        context.suspended_paths.retain(|id, _| {
            results.get(id).map(|r| r.status) == Some(StepStatus::Suspended)
        });
        let live: Vec<Vec<usize>> = context.suspended_paths.values().cloned().collect();
        context.resume_labels.retain(|_, target| live.contains(target));

        self.durable.forget_run(workflow.id(), &options.run_id).await?;
        let abort = self.register(&options.run_id)?;

        tracing::info!(
            workflow_id = workflow.id(),
            run_id = %options.run_id,
            step_id = %options.step_id,
            path = ?path,
            "time traveling workflow run"
        );
        self.emit(
            &options.run_id,
            WorkflowEventType::WorkflowStart,
            json!({ "runId": options.run_id, "timeTravel": options.step_id }),
        )
        .await;

        let request_context = options
            .request_context
            .unwrap_or_else(|| RequestContext::from_json_map(snapshot.request_context.clone()));
        let state = RunState {
            scope: RunScope {
                workflow,
                run_id: options.run_id,
                resource_id: None,
                abort,
                request_context,
            },
            results,
            context,
            start_index: path[0],
            resume: None,
            time_travel: Some(TimeTravelParams {
                step_id: options.step_id,
                path: path[1..].to_vec(),
                input: options.input,
            }),
            restart: false,
        };
        self.drive(state).await
    }

    /// Cancel a run.
    ///
    /// An executing run is signalled and settles as `canceled` at its next
    /// checkpoint. A stored run that is not executing here is marked
    /// `canceled` directly. Returns `false` when the run already finished.
    pub async fn cancel(&self, workflow: &Workflow, run_id: &str) -> Result<bool, EngineError> {
        if let Some(token) = self.runs.get(run_id) {
            token.cancel();
            tracing::info!(workflow_id = workflow.id(), run_id, "cancellation requested");
            return Ok(true);
        }

        let mut snapshot = self.load(workflow, run_id).await?;
        if snapshot.status.is_terminal() {
            return Ok(false);
        }
        snapshot.status = WorkflowRunStatus::Canceled;
        snapshot.active_steps_path.clear();
        snapshot.timestamp = Utc::now().timestamp_millis();
        self.store
            .persist_workflow_snapshot(PersistSnapshotParams {
                workflow_name: workflow.id().to_string(),
                run_id: run_id.to_string(),
                resource_id: None,
                snapshot,
            })
            .await?;
        self.durable.forget_run(workflow.id(), run_id).await?;

        tracing::info!(workflow_id = workflow.id(), run_id, "stored run canceled");
        self.emit(run_id, WorkflowEventType::WorkflowCanceled, json!({ "runId": run_id }))
            .await;
        self.publisher.flush().await;
        Ok(true)
    }

    /// Subscribe to a run's events.
    pub fn watch(&self, run_id: &str) -> broadcast::Receiver<WatchEvent> {
        self.pubsub.subscribe(&run_channel(run_id))
    }

    pub async fn get_run(&self, workflow: &Workflow, run_id: &str) -> Result<Option<WorkflowSnapshot>, EngineError> {
        Ok(self.store.load_workflow_snapshot(workflow.id(), run_id).await?)
    }

    pub async fn list_runs(&self, workflow: &Workflow) -> Result<Vec<WorkflowRunRecord>, EngineError> {
        Ok(self.store.list_workflow_runs(workflow.id()).await?)
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    fn register(&self, run_id: &str) -> Result<CancellationToken, EngineError> {
        match self.runs.entry(run_id.to_string()) {
            Entry::Occupied(_) => Err(EngineError::RunActive {
                run_id: run_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Ok(token)
            }
        }
    }

    async fn load(&self, workflow: &Workflow, run_id: &str) -> Result<WorkflowSnapshot, EngineError> {
        self.store
            .load_workflow_snapshot(workflow.id(), run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound {
                workflow_id: workflow.id().to_string(),
                run_id: run_id.to_string(),
            })
    }

    async fn emit(&self, run_id: &str, event_type: WorkflowEventType, payload: Value) {
        self.publisher
            .publish(WatchEvent::new(run_id, event_type, payload))
            .await;
    }

    async fn persist(
        &self,
        state: &RunState<'_>,
        status: WorkflowRunStatus,
        path: &[usize],
        result: Option<Value>,
        error: Option<SerializedError>,
    ) -> Result<bool, EngineError> {
        let workflow = state.scope.workflow;
        self.persister
            .persist_step_update(StepUpdate {
                workflow_id: workflow.id(),
                run_id: &state.scope.run_id,
                resource_id: state.scope.resource_id.as_deref(),
                serialized_graph: workflow.serialized_graph(),
                step_results: &state.results,
                context: &state.context,
                workflow_status: status,
                result,
                error,
                request_context: &state.scope.request_context,
                path,
                iterations: &[],
                gate: workflow.should_persist_snapshot(),
            })
            .await
    }

    /// Turn an execution error into the run's error.
    fn run_failure(&self, scope: &RunScope<'_>, err: EngineError) -> SerializedError {
        if !err.is_storage() {
            tracing::error!(run_id = %scope.run_id, error = %err, "workflow run failed");
            return SerializedError::from_error(&err);
        }
        let wrapped = DomainError::new(
            WORKFLOW_SNAPSHOT_PERSIST_FAILED,
            ErrorDomain::Storage,
            ErrorCategory::System,
            "Failed to persist workflow snapshot",
        )
        .with_detail("workflowId", scope.workflow.id())
        .with_detail("runId", scope.run_id.clone())
        .with_cause(err);
        self.tracker.track_exception(&wrapped);
        tracing::error!(run_id = %scope.run_id, error = %wrapped, "snapshot persistence failed; failing run");
        wrapped.to_serialized()
    }

    /// Execute top-level entries from `state.start_index` until the run
    /// settles, then persist and announce the final state.
    async fn drive(&self, state: RunState<'_>) -> Result<RunOutcome, EngineError> {
        let span = tracing::info_span!(
            "workflow.run",
            workflow_id = state.scope.workflow.id(),
            run_id = %state.scope.run_id,
        );
        self.drive_entries(state).instrument(span).await
    }

    async fn drive_entries(&self, mut state: RunState<'_>) -> Result<RunOutcome, EngineError> {
        let graph = state.scope.workflow.graph();
        let mut status = WorkflowRunStatus::Running;
        let mut error: Option<SerializedError> = None;
        let mut bailed: Option<Value> = None;
        let mut storage_failed = false;
        let mut index = state.start_index;

        while index < graph.len() {
            if state.scope.abort.is_cancelled() {
                status = WorkflowRunStatus::Canceled;
                self.emit(
                    &state.scope.run_id,
                    WorkflowEventType::WorkflowCanceled,
                    json!({ "runId": state.scope.run_id, "path": [index] }),
                )
                .await;
                break;
            }

            let entry = &graph[index];
            let first = index == state.start_index;
            let input = previous_output(index.checked_sub(1).map(|i| &graph[i]), &state.results);
            let entry_ctx = state.context.at_path(vec![index]);
            let executed = self
                .executor
                .execute_entry(EntryParams {
                    run: &state.scope,
                    entry,
                    input,
                    step_results: &state.results,
                    context: &entry_ctx,
                    resume: if first { state.resume.take() } else { None },
                    time_travel: if first { state.time_travel.take() } else { None },
                    restart: first && state.restart,
                    iterations: Vec::new(),
                })
                .await;

            let outcome = match executed {
                Ok(outcome) => outcome,
                Err(err) => {
                    storage_failed = err.is_storage();
                    status = WorkflowRunStatus::Failed;
                    error = Some(self.run_failure(&state.scope, err));
                    break;
                }
            };

            for (id, result) in outcome.step_results {
                state.results.insert(id, result);
            }
            outcome.delta.apply(&mut state.context);

            match outcome.result.status {
                StepStatus::Success if outcome.bailed => {
                    tracing::info!(run_id = %state.scope.run_id, entry_id = entry.id(), "run bailed");
                    bailed = Some(outcome.result.output.unwrap_or(Value::Null));
                    break;
                }
                StepStatus::Success => {
                    if let Err(err) = self
                        .persist(&state, WorkflowRunStatus::Running, &[index], None, None)
                        .await
                    {
                        storage_failed = err.is_storage();
                        status = WorkflowRunStatus::Failed;
                        error = Some(self.run_failure(&state.scope, err));
                        break;
                    }
                    index += 1;
                }
                StepStatus::Failed => {
                    status = WorkflowRunStatus::Failed;
                    error = outcome.result.error;
                    break;
                }
                StepStatus::Suspended => {
                    status = WorkflowRunStatus::Suspended;
                    break;
                }
                StepStatus::Canceled => {
                    status = WorkflowRunStatus::Canceled;
                    break;
                }
                StepStatus::Running | StepStatus::Waiting => {
                    status = WorkflowRunStatus::Failed;
                    error = Some(SerializedError::new(
                        "Error",
                        format!("entry '{}' did not settle", entry.id()),
                    ));
                    break;
                }
            }
        }

        let mut result = None;
        if status == WorkflowRunStatus::Running {
            let output = bailed.unwrap_or_else(|| previous_output(graph.last(), &state.results));
            match state.scope.workflow.output_validator().map(|schema| schema.validate(&output)) {
                Some(Err(violations)) => {
                    status = WorkflowRunStatus::Failed;
                    error = Some(SerializedError::new(
                        "Error",
                        format!("workflow output failed validation: {}", violations.join("; ")),
                    ));
                }
                _ => {
                    status = WorkflowRunStatus::Success;
                    result = Some(output);
                }
            }
        }
        if status != WorkflowRunStatus::Suspended {
            state.context.active_steps_path.clear();
        }

        let final_path = [index.min(graph.len())];
        if let Err(err) = self
            .persist(&state, status, &final_path, result.clone(), error.clone())
            .await
        {
            if storage_failed {
                tracing::warn!(run_id = %state.scope.run_id, error = %err, "final snapshot write failed");
            } else {
                status = WorkflowRunStatus::Failed;
                result = None;
                error = Some(self.run_failure(&state.scope, err));
            }
        }

        tracing::info!(
            workflow_id = state.scope.workflow.id(),
            run_id = %state.scope.run_id,
            status = status.as_str(),
            "workflow run settled"
        );
        self.emit(
            &state.scope.run_id,
            WorkflowEventType::WorkflowFinish,
            json!({
                "runId": state.scope.run_id,
                "status": status,
                "result": result,
                "error": error,
            }),
        )
        .await;
        self.publisher.flush().await;

        let workflow_id = state.scope.workflow.id();
        if status.is_terminal() {
            // Terminal runs never replay.
            if let Err(err) = self.durable.forget_run(workflow_id, &state.scope.run_id).await {
                tracing::warn!(run_id = %state.scope.run_id, error = %err, "failed to clear durable operation records");
            }
        }
        self.durable.release_locks(workflow_id, &state.scope.run_id);
        self.runs.remove(&state.scope.run_id);

        Ok(RunOutcome {
            run_id: state.scope.run_id,
            status,
            result,
            error,
            steps: state.results,
            state: state.context.state,
            suspended: state.context.suspended_paths,
        })
    }
}

/// Execution context rebuilt from a stored snapshot.
fn restore_context(
    workflow: &Workflow,
    snapshot: &WorkflowSnapshot,
    default_retry: RetryConfig,
) -> ExecutionContext {
    let mut context = ExecutionContext::new(
        workflow.id(),
        &snapshot.run_id,
        workflow.retry_config().unwrap_or(default_retry),
        snapshot.value.clone(),
    );
    context.suspended_paths = snapshot.suspended_paths.clone();
    context.active_steps_path = snapshot.active_steps_path.clone();
    context.resume_labels = snapshot.resume_labels.clone();
    context
}

/// Whether a top-level entry finished before the process stopped.
fn entry_settled(entry: &StepFlowEntry, results: &StepResults) -> bool {
    match entry {
        StepFlowEntry::Parallel { steps, .. } => steps
            .iter()
            .all(|child| results.get(child.result_key()).is_some_and(|r| r.is_success())),
        StepFlowEntry::Conditional { steps, .. } => {
            let ran: Vec<_> = steps
                .iter()
                .filter_map(|child| results.get(child.result_key()))
                .collect();
            !ran.is_empty() && ran.iter().all(|r| r.is_success())
        }
        other => results.get(other.result_key()).is_some_and(|r| r.is_success()),
    }
}

/// Resolve a resume target to the suspended step id and its full path.
fn resolve_resume_target(
    workflow: &Workflow,
    snapshot: &WorkflowSnapshot,
    target: &ResumeTarget,
) -> Result<(String, Vec<usize>), EngineError> {
    let suspended = &snapshot.suspended_paths;
    match target {
        ResumeTarget::Auto => suspended
            .iter()
            .next()
            .map(|(id, path)| (id.clone(), path.clone()))
            .ok_or_else(|| EngineError::NothingToResume(snapshot.run_id.clone())),
        ResumeTarget::Step(step_id) => suspended
            .get(step_id)
            .map(|path| (step_id.clone(), path.clone()))
            .ok_or_else(|| EngineError::NothingToResume(format!("step '{step_id}' is not suspended"))),
        ResumeTarget::Label(label) => {
            let path = snapshot
                .resume_labels
                .get(label)
                .ok_or_else(|| EngineError::NothingToResume(format!("no suspended step for label '{label}'")))?;
            resolve_path(workflow, snapshot, path)
        }
        ResumeTarget::Path(path) => resolve_path(workflow, snapshot, path),
    }
}

fn resolve_path(
    workflow: &Workflow,
    snapshot: &WorkflowSnapshot,
    path: &[usize],
) -> Result<(String, Vec<usize>), EngineError> {
    if let Some((id, _)) = snapshot.suspended_paths.iter().find(|(_, p)| p.as_slice() == path) {
        return Ok((id.clone(), path.to_vec()));
    }

    // Any suspended item of a foreach may be resumed, not only the first.
    if let [index, item] = path {
        if let Some(StepFlowEntry::Foreach { step, .. }) = workflow.graph().get(*index) {
            let item_suspended = snapshot
                .context
                .get(step.result_key())
                .and_then(|r| r.metadata.get("foreachStatuses"))
                .and_then(|statuses| statuses.get(*item))
                .and_then(Value::as_str)
                == Some(StepStatus::Suspended.as_str());
            if item_suspended {
                return Ok((step.result_key().to_string(), path.to_vec()));
            }
        }
    }

    Err(EngineError::InvalidResumePath {
        path: path.to_vec(),
        reason: "no suspended step at this path".to_string(),
    })
}
