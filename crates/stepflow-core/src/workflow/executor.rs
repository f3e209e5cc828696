//! Step-graph entry executor.
//!
//! [`EntryExecutor::execute_entry`] runs one [`StepFlowEntry`] to a settled
//! [`StepResult`], recursing into composite entries:
//!
//! - **step**: runs the handler with retries, honoring suspend and bail
//! - **parallel**: every branch concurrently; results merged in completion order
//! - **conditional**: every branch whose predicate holds, concurrently
//! - **loop**: body first, then the condition, until it says stop
//! - **foreach**: body once per input item with bounded concurrency
//! - **sleep / sleep-until**: parks the run as `waiting`, then wakes
//!
//! The executor never writes the caller's step results or context. Writes
//! come back in the [`EntryOutcome`] for the caller to merge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, FuturesUnordered, StreamExt};
use serde_json::{Map, Value, json};
use stepflow_types::error::{
    DomainError, ErrorCategory, ErrorDomain, SerializedError, WORKFLOW_CONDITION_EVALUATION_FAILED,
};
use stepflow_types::event::{WatchEvent, WorkflowEventType};
use stepflow_types::workflow::{
    ExecutionContext, ForeachFailurePolicy, LoopType, StepResult, StepResults, StepStatus, WorkflowRunStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::builder::Workflow;
use super::context::{ContextChange, EntryOutcome, overlay};
use super::durable::{DurableOperations, operation_id, scoped_operation};
use super::error::{ConditionError, EngineError, StepError};
use super::graph::{Condition, EvalContext, ForeachOptions, SleepDuration, StepFlowEntry, WakeTime};
use super::persist::{SnapshotPersister, StepUpdate};
use super::retry::RetryPolicy;
use super::step::{Step, StepContext, StepContextParts, StepControl};
use crate::event::EventPublisher;
use crate::repository::workflow::WorkflowStore;
use crate::request_context::RequestContext;
use crate::telemetry::TrackingSink;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Run-wide values shared by every entry of one execution.
pub struct RunScope<'w> {
    pub workflow: &'w Workflow,
    pub run_id: String,
    pub resource_id: Option<String>,
    pub abort: CancellationToken,
    pub request_context: RequestContext,
}

/// A resume aimed at a suspended step.
///
/// `path` is relative to the entry receiving it: each composite level
/// consumes its first element.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeParams {
    pub step_id: String,
    pub path: Vec<usize>,
    pub resume_data: Value,
    pub label: Option<String>,
}

impl ResumeParams {
    /// The part of this resume aimed at child `index`, if any.
    fn descend(&self, index: usize) -> Option<Self> {
        (self.path.first() == Some(&index)).then(|| Self {
            path: self.path[1..].to_vec(),
            ..self.clone()
        })
    }
}

/// A re-execution starting at a chosen step.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeTravelParams {
    pub step_id: String,
    pub path: Vec<usize>,
    /// Replacement input for the target step.
    pub input: Option<Value>,
}

impl TimeTravelParams {
    fn descend(&self, index: usize) -> Option<Self> {
        (self.path.first() == Some(&index)).then(|| Self {
            path: self.path[1..].to_vec(),
            ..self.clone()
        })
    }
}

/// Everything needed to execute one entry.
pub struct EntryParams<'a> {
    pub run: &'a RunScope<'a>,
    pub entry: &'a StepFlowEntry,
    pub input: Value,
    pub step_results: &'a StepResults,
    /// Context addressed at this entry (`execution_path` set).
    pub context: &'a ExecutionContext,
    pub resume: Option<ResumeParams>,
    pub time_travel: Option<TimeTravelParams>,
    /// Re-entering an entry that was in flight when the process stopped.
    pub restart: bool,
    /// Loop iterations enclosing this entry, outermost first.
    pub iterations: Vec<u32>,
}

impl EntryParams<'_> {
    /// Child index a resume or time travel is aimed at.
    fn target_index(&self) -> Option<usize> {
        self.resume
            .as_ref()
            .and_then(|r| r.path.first().copied())
            .or_else(|| self.time_travel.as_ref().and_then(|t| t.path.first().copied()))
    }
}

fn child_path(base: &[usize], index: usize) -> Vec<usize> {
    let mut path = base.to_vec();
    path.push(index);
    path
}

fn eval_context(
    run: &RunScope<'_>,
    input: Value,
    step_results: &StepResults,
    ctx: &ExecutionContext,
    iteration_count: u32,
) -> EvalContext {
    EvalContext {
        run_id: run.run_id.clone(),
        workflow_id: run.workflow.id().to_string(),
        input,
        state: ctx.state.clone(),
        step_results: Arc::new(step_results.clone()),
        iteration_count,
        request_context: run.request_context.clone(),
    }
}

enum SleepTiming<'e> {
    For(&'e SleepDuration),
    Until(&'e WakeTime),
}

/// Wall-clock wake time for a sleep of `duration` starting at `now`.
///
/// Durations past chrono's range saturate to the latest representable
/// instant, never to `now`.
fn wake_after(now: DateTime<Utc>, duration: std::time::Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// EntryExecutor
// ---------------------------------------------------------------------------

/// Executes step-graph entries.
///
/// Generic over `S: WorkflowStore` so sleeps can persist their `waiting`
/// snapshot through the same store the engine uses.
pub struct EntryExecutor<S: WorkflowStore> {
    persister: Arc<SnapshotPersister<S>>,
    durable: Arc<DurableOperations<S>>,
    publisher: EventPublisher,
    tracker: Arc<dyn TrackingSink>,
    foreach_concurrency: usize,
}

impl<S: WorkflowStore> EntryExecutor<S> {
    pub fn new(
        persister: Arc<SnapshotPersister<S>>,
        durable: Arc<DurableOperations<S>>,
        publisher: EventPublisher,
        tracker: Arc<dyn TrackingSink>,
        foreach_concurrency: usize,
    ) -> Self {
        Self {
            persister,
            durable,
            publisher,
            tracker,
            foreach_concurrency: foreach_concurrency.max(1),
        }
    }

    /// Execute one entry to a settled result.
    ///
    /// If the run was cancelled while the entry ran, the result is forced to
    /// `canceled` and a `workflow-canceled` event is published.
    pub async fn execute_entry(&self, params: EntryParams<'_>) -> Result<EntryOutcome, EngineError> {
        let run = params.run;
        let entry = params.entry;
        let path = params.context.execution_path.clone();

        let mut outcome = self.dispatch(params).await?;

        if run.abort.is_cancelled() {
            outcome.result = outcome.result.cancel();
            if let Some(recorded) = outcome.step_results.get_mut(entry.result_key()) {
                recorded.status = StepStatus::Canceled;
            }
            tracing::info!(run_id = %run.run_id, entry_id = entry.id(), path = ?path, "entry canceled");
            self.emit(
                run,
                WorkflowEventType::WorkflowCanceled,
                json!({ "id": entry.id(), "path": path }),
            )
            .await;
        }
        Ok(outcome)
    }

    fn dispatch<'a>(&'a self, params: EntryParams<'a>) -> BoxFuture<'a, Result<EntryOutcome, EngineError>> {
        let span = tracing::info_span!(
            "workflow.entry",
            entry_id = params.entry.id(),
            path = ?params.context.execution_path,
            iterations = ?params.iterations,
        );
        let execution = async move {
            match params.entry {
                StepFlowEntry::Step(step) => self.run_step(step, params).await,
                StepFlowEntry::Parallel { steps, .. } => self.run_parallel(steps, params).await,
                StepFlowEntry::Conditional { steps, conditions, .. } => {
                    self.run_conditional(steps, conditions, params).await
                }
                StepFlowEntry::Loop {
                    step,
                    condition,
                    loop_type,
                    ..
                } => self.run_loop(step, condition, *loop_type, params).await,
                StepFlowEntry::Foreach { step, options, .. } => self.run_foreach(step, *options, params).await,
                StepFlowEntry::Sleep { id, duration } => {
                    self.run_sleep(id, SleepTiming::For(duration), params).await
                }
                StepFlowEntry::SleepUntil { id, wake } => self.run_sleep(id, SleepTiming::Until(wake), params).await,
            }
        };
        Box::pin(execution.instrument(span))
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    async fn emit(&self, run: &RunScope<'_>, event_type: WorkflowEventType, payload: Value) {
        self.publisher
            .publish(WatchEvent::new(run.run_id.clone(), event_type, payload))
            .await;
    }

    /// Publish at most once per run, path and event type.
    async fn emit_durable(
        &self,
        run: &RunScope<'_>,
        path: &[usize],
        iterations: &[u32],
        event_type: WorkflowEventType,
        payload: Value,
    ) -> Result<(), EngineError> {
        let op_id = operation_id(
            run.workflow.id(),
            &run.run_id,
            path,
            &scoped_operation(iterations, &format!("event.{}", event_type.as_str())),
        );
        self.durable
            .wrap(&op_id, || async move {
                self.emit(run, event_type, payload).await;
                Ok(())
            })
            .await
    }

    async fn emit_settled(&self, run: &RunScope<'_>, id: &str, path: &[usize], result: &StepResult) {
        if result.status == StepStatus::Suspended {
            self.emit(
                run,
                WorkflowEventType::WorkflowStepSuspended,
                json!({
                    "id": id,
                    "path": path,
                    "status": result.status,
                    "suspendPayload": result.suspend_payload,
                }),
            )
            .await;
        } else {
            self.emit(
                run,
                WorkflowEventType::WorkflowStepResult,
                json!({
                    "id": id,
                    "path": path,
                    "status": result.status,
                    "output": result.output,
                    "error": result.error,
                    "payload": result.payload,
                    "endedAt": result.ended_at.map(|t| t.timestamp_millis()),
                }),
            )
            .await;
        }
        self.emit(
            run,
            WorkflowEventType::WorkflowStepFinish,
            json!({ "id": id, "path": path, "metadata": {} }),
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Step
    // -----------------------------------------------------------------------

    async fn run_step(&self, step: &Step, params: EntryParams<'_>) -> Result<EntryOutcome, EngineError> {
        let run = params.run;
        let ctx = params.context;
        let path = ctx.execution_path.clone();
        let step_id = step.id().to_string();

        let resume = params.resume.filter(|r| r.step_id == step_id);
        let input = match params.time_travel {
            Some(tt) if tt.step_id == step_id => tt.input.unwrap_or(params.input),
            _ => params.input,
        };

        let started_at = Utc::now();
        let mut running = StepResult::running(Some(input.clone()), started_at);
        let mut outcome = EntryOutcome::new(running.clone(), run.request_context.clone());

        if run.abort.is_cancelled() {
            outcome.result = running.cancel();
            outcome.step_results.insert(step_id, outcome.result.clone());
            return Ok(outcome);
        }

        if let Some(resume) = &resume {
            if let Some(previous) = params.step_results.get(&step_id) {
                running.suspend_payload = previous.suspend_payload.clone();
                running.suspended_at = previous.suspended_at;
            }
            running.resume_payload = Some(resume.resume_data.clone());
            running.resumed_at = Some(Utc::now());
            outcome.delta.push(ContextChange::Resumed {
                step_id: step_id.clone(),
            });
        }
        outcome.delta.push(ContextChange::Active {
            step_id: step_id.clone(),
            path: path.clone(),
        });

        self.emit(
            run,
            WorkflowEventType::WorkflowStepStart,
            json!({
                "id": step_id,
                "path": path,
                "payload": input,
                "startedAt": started_at.timestamp_millis(),
                "status": "running",
            }),
        )
        .await;

        let resume_data = resume.map(|r| r.resume_data);
        let settled = match validate_step_payloads(step, &input, resume_data.as_ref()) {
            Err(err) => running.fail(err.to_serialized()),
            Ok(()) => {
                let (result, control) = self
                    .attempt_step(step, &params_view(run, params.step_results, ctx), input, resume_data)
                    .await;
                self.settle_step(step, running, result, control, &path, &mut outcome)
            }
        };

        if settled.status == StepStatus::Failed {
            tracing::warn!(
                run_id = %run.run_id,
                step_id = %step_id,
                error = ?settled.error.as_ref().map(|e| e.message.as_str()),
                "step failed"
            );
        }

        outcome.delta.push(ContextChange::Inactive {
            step_id: step_id.clone(),
        });
        self.emit_settled(run, &step_id, &path, &settled).await;
        outcome.step_results.insert(step_id, settled.clone());
        outcome.result = settled;
        Ok(outcome)
    }

    /// Run the handler, retrying thrown errors per the step's policy.
    async fn attempt_step(
        &self,
        step: &Step,
        view: &StepView<'_>,
        input: Value,
        resume_data: Option<Value>,
    ) -> (Result<Value, StepError>, StepControl) {
        let policy = RetryPolicy::resolve(step.retry_override(), &view.context.retry_config);
        let shared_results = Arc::new(view.step_results.clone());
        let mut retry_count = 0;

        loop {
            let control = Arc::new(Mutex::new(StepControl::default()));
            let step_ctx = StepContext::new(
                StepContextParts {
                    run_id: view.run.run_id.clone(),
                    workflow_id: view.run.workflow.id().to_string(),
                    step_id: step.id().to_string(),
                    input: input.clone(),
                    resume_data: resume_data.clone(),
                    state: view.context.state.clone(),
                    step_results: shared_results.clone(),
                    request_context: view.run.request_context.clone(),
                    abort: view.run.abort.clone(),
                    retry_count,
                },
                control.clone(),
            );

            let result = step.handler().execute_boxed(step_ctx).await;
            match result {
                Err(err) if policy.should_retry(retry_count) && !view.run.abort.is_cancelled() => {
                    tracing::warn!(
                        run_id = %view.run.run_id,
                        step_id = step.id(),
                        retry_count,
                        error = %err,
                        "step attempt failed; retrying"
                    );
                    retry_count += 1;
                    if !policy.delay.is_zero() {
                        tokio::time::sleep(policy.delay).await;
                    }
                }
                other => {
                    let control = std::mem::take(&mut *control.lock().unwrap_or_else(PoisonError::into_inner));
                    return (other, control);
                }
            }
        }
    }

    fn settle_step(
        &self,
        step: &Step,
        running: StepResult,
        result: Result<Value, StepError>,
        control: StepControl,
        path: &[usize],
        outcome: &mut EntryOutcome,
    ) -> StepResult {
        let output = match result {
            Ok(output) => output,
            Err(err) => return running.fail(err.to_serialized()),
        };

        if let Some(state) = control.state {
            outcome.delta.push(ContextChange::State(state));
        }

        if let Some(suspension) = control.suspended {
            outcome.delta.push(ContextChange::Suspended {
                step_id: step.id().to_string(),
                path: path.to_vec(),
            });
            if let Some(label) = suspension.label {
                outcome.delta.push(ContextChange::Label {
                    label,
                    path: path.to_vec(),
                });
            }
            return running.suspend(suspension.payload);
        }

        if let Some(result) = control.bailed {
            outcome.bailed = true;
            return running.succeed(result);
        }

        if let Some(schema) = step.output_validator() {
            if let Err(violations) = schema.validate(&output) {
                return running.fail(StepError::InvalidOutput(violations.join("; ")).to_serialized());
            }
        }
        running.succeed(output)
    }

    // -----------------------------------------------------------------------
    // Parallel and conditional
    // -----------------------------------------------------------------------

    /// Run the children at `indices` concurrently, merging their writes in
    /// completion order.
    async fn run_branches(
        &self,
        children: &[StepFlowEntry],
        indices: &[usize],
        params: &EntryParams<'_>,
    ) -> Result<EntryOutcome, EngineError> {
        let run = params.run;
        let step_results = params.step_results;
        let mut pending = FuturesUnordered::new();

        for &j in indices {
            let child = &children[j];
            let child_ctx = params.context.at_path(child_path(&params.context.execution_path, j));
            let resume = params.resume.as_ref().and_then(|r| r.descend(j));
            let time_travel = params.time_travel.as_ref().and_then(|t| t.descend(j));
            let input = params.input.clone();
            let restart = params.restart;
            let iterations = params.iterations.clone();
            pending.push(async move {
                let outcome = self
                    .dispatch(EntryParams {
                        run,
                        entry: child,
                        input,
                        step_results,
                        context: &child_ctx,
                        resume,
                        time_travel,
                        restart,
                        iterations,
                    })
                    .await;
                (j, outcome)
            });
        }

        let mut merged = EntryOutcome::new(
            StepResult::running(Some(params.input.clone()), Utc::now()),
            run.request_context.clone(),
        );
        while let Some((j, outcome)) = pending.next().await {
            let outcome = outcome?;
            let settled = outcome.result.clone();
            merged.absorb(outcome);
            merged.step_results.insert(children[j].result_key().to_string(), settled);
        }
        Ok(merged)
    }

    /// Re-assert the suspensions of branches a targeted execution skipped.
    fn reassert_suspended(
        children: &[StepFlowEntry],
        targeted: usize,
        view: &StepResults,
        params: &EntryParams<'_>,
        outcome: &mut EntryOutcome,
    ) {
        for (k, child) in children.iter().enumerate() {
            if k == targeted {
                continue;
            }
            let key = child.result_key();
            if view.get(key).map(|r| r.status) == Some(StepStatus::Suspended) {
                let path = params
                    .context
                    .suspended_paths
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| child_path(&params.context.execution_path, k));
                outcome.delta.push(ContextChange::Suspended {
                    step_id: key.to_string(),
                    path,
                });
            }
        }
    }

    async fn run_parallel(&self, children: &[StepFlowEntry], params: EntryParams<'_>) -> Result<EntryOutcome, EngineError> {
        let targeted = params.target_index();
        let indices: Vec<usize> = match targeted {
            Some(j) if j >= children.len() => {
                return Err(EngineError::InvalidResumePath {
                    path: child_path(&params.context.execution_path, j),
                    reason: format!("parallel block has {} branches", children.len()),
                });
            }
            Some(j) => vec![j],
            None => (0..children.len()).collect(),
        };

        let mut outcome = self.run_branches(children, &indices, &params).await?;
        let view = overlay(params.step_results, &outcome.step_results);
        if let Some(j) = targeted {
            Self::reassert_suspended(children, j, &view, &params, &mut outcome);
        }

        let ran: Vec<usize> = (0..children.len()).collect();
        outcome.result = aggregate_branches(children, &ran, &view, outcome.result);
        Ok(outcome)
    }

    async fn run_conditional(
        &self,
        children: &[StepFlowEntry],
        conditions: &[Condition],
        params: EntryParams<'_>,
    ) -> Result<EntryOutcome, EngineError> {
        let run = params.run;
        let entry_id = params.entry.id();
        let targeted = params.target_index();

        let indices: Vec<usize> = match targeted {
            Some(j) if j >= children.len() => {
                return Err(EngineError::InvalidResumePath {
                    path: child_path(&params.context.execution_path, j),
                    reason: format!("conditional block has {} branches", children.len()),
                });
            }
            Some(j) => vec![j],
            None => {
                let mut matched = Vec::new();
                for (j, condition) in conditions.iter().enumerate() {
                    let eval = eval_context(run, params.input.clone(), params.step_results, params.context, 0);
                    match condition.evaluate(eval).await {
                        Ok(true) => matched.push(j),
                        Ok(false) => {}
                        Err(err) => {
                            self.condition_failure(run, &format!("{entry_id}-condition-{j}"), err);
                        }
                    }
                }
                tracing::debug!(run_id = %run.run_id, entry_id, matched = ?matched, "conditional branches selected");
                matched
            }
        };

        let mut outcome = self.run_branches(children, &indices, &params).await?;
        let view = overlay(params.step_results, &outcome.step_results);

        let ran: Vec<usize> = match targeted {
            Some(j) => {
                Self::reassert_suspended(children, j, &view, &params, &mut outcome);
                (0..children.len())
                    .filter(|&k| view.get(children[k].result_key()).is_some())
                    .collect()
            }
            None => indices,
        };
        outcome.result = aggregate_branches(children, &ran, &view, outcome.result);
        Ok(outcome)
    }

    /// Wrap, track and log a predicate failure.
    fn condition_failure(&self, run: &RunScope<'_>, condition_id: &str, err: ConditionError) -> DomainError {
        let wrapped = DomainError::new(
            WORKFLOW_CONDITION_EVALUATION_FAILED,
            ErrorDomain::Workflow,
            ErrorCategory::User,
            format!("Error evaluating condition: {err}"),
        )
        .with_detail("workflowId", run.workflow.id())
        .with_detail("runId", run.run_id.clone())
        .with_detail("conditionId", condition_id);

        let wrapped = match err {
            ConditionError::Domain(domain) => wrapped.with_cause(domain),
            ConditionError::Other(other) => {
                let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = other.into();
                wrapped.with_shared_cause(Arc::from(boxed))
            }
        };

        self.tracker.track_exception(&wrapped);
        tracing::error!(
            run_id = %run.run_id,
            condition_id,
            error_id = %wrapped.id,
            "{wrapped}"
        );
        wrapped
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    async fn run_loop(
        &self,
        body: &StepFlowEntry,
        condition: &Condition,
        loop_type: LoopType,
        params: EntryParams<'_>,
    ) -> Result<EntryOutcome, EngineError> {
        let run = params.run;
        let loop_id = params.entry.id().to_string();
        let mut results_view = params.step_results.clone();
        let mut ctx_view = params.context.clone();
        let mut outcome = EntryOutcome::new(
            StepResult::running(Some(params.input.clone()), Utc::now()),
            run.request_context.clone(),
        );

        // A resumed body re-runs the iteration it suspended in.
        let mut body_input = match (&params.resume, params.step_results.get(body.result_key())) {
            (Some(_), Some(suspended)) => suspended.payload.clone().unwrap_or(params.input),
            _ => params.input,
        };
        let mut resume = params.resume;
        let mut time_travel = params.time_travel;
        let mut iteration: u32 = 0;

        loop {
            let body_outcome = self
                .dispatch(EntryParams {
                    run,
                    entry: body,
                    input: body_input,
                    step_results: &results_view,
                    context: &ctx_view,
                    resume: resume.take(),
                    time_travel: time_travel.take(),
                    restart: params.restart && iteration == 0,
                    iterations: params.iterations.iter().copied().chain([iteration]).collect(),
                })
                .await?;

            for (id, result) in &body_outcome.step_results {
                results_view.insert(id.clone(), result.clone());
            }
            body_outcome.delta.apply(&mut ctx_view);
            let last = body_outcome.result.clone();
            outcome.absorb(body_outcome);

            if !last.is_success() || outcome.bailed {
                outcome.result = last;
                break;
            }

            iteration += 1;
            let output = last.output.clone().unwrap_or(Value::Null);
            let eval = eval_context(run, output.clone(), &results_view, &ctx_view, iteration);
            let holds = match condition.evaluate(eval).await {
                Ok(holds) => holds,
                Err(err) => {
                    let wrapped = self.condition_failure(run, &format!("{loop_id}-condition"), err);
                    outcome.result = StepResult::running(last.payload.clone(), last.started_at)
                        .fail(wrapped.to_serialized());
                    break;
                }
            };

            let again = match loop_type {
                LoopType::DoWhile => holds,
                LoopType::DoUntil => !holds,
            };
            if !again || run.abort.is_cancelled() {
                tracing::debug!(run_id = %run.run_id, loop_id = %loop_id, iteration, "loop finished");
                outcome.result = last;
                break;
            }
            body_input = output;
        }

        outcome
            .step_results
            .insert(body.result_key().to_string(), outcome.result.clone());
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Foreach
    // -----------------------------------------------------------------------

    async fn run_foreach(
        &self,
        body: &StepFlowEntry,
        options: ForeachOptions,
        params: EntryParams<'_>,
    ) -> Result<EntryOutcome, EngineError> {
        let run = params.run;
        let key = body.result_key().to_string();
        let base_path = params.context.execution_path.clone();

        let input = match &params.time_travel {
            Some(tt) if tt.step_id == key => tt.input.clone().unwrap_or_else(|| params.input.clone()),
            _ => params.input.clone(),
        };
        let mut outcome = EntryOutcome::new(
            StepResult::running(Some(input.clone()), Utc::now()),
            run.request_context.clone(),
        );

        let Value::Array(items) = &input else {
            outcome.result = outcome
                .result
                .fail(SerializedError::new("Error", "foreach input must be an array"));
            outcome.step_results.insert(key, outcome.result.clone());
            return Ok(outcome);
        };
        let n = items.len();

        let mut items_state = ForeachItems::new(n);
        if params.resume.is_some() || params.restart {
            if let Some(previous) = params.step_results.get(&key) {
                items_state.restore(previous);
            }
        }

        let target = params.resume.as_ref().and_then(|r| r.path.first().copied());
        if let Some(k) = target {
            if k >= n || items_state.statuses[k] != Some(StepStatus::Suspended) {
                return Err(EngineError::InvalidResumePath {
                    path: child_path(&base_path, k),
                    reason: "foreach item is not suspended".to_string(),
                });
            }
        }
        let to_run: Vec<usize> = (0..n)
            .filter(|&k| match items_state.statuses[k] {
                Some(StepStatus::Success) => false,
                Some(StepStatus::Suspended) if params.resume.is_some() => Some(k) == target,
                _ => true,
            })
            .collect();

        let concurrency = options.concurrency.unwrap_or(self.foreach_concurrency).max(1);
        let fail_fast = options.failure_policy == ForeachFailurePolicy::FailFast;
        let halted = AtomicBool::new(false);
        let halted = &halted;
        let step_results = params.step_results;
        let context = params.context;
        let resume = &params.resume;
        let iterations = &params.iterations;

        let mut results = stream::iter(to_run.into_iter().map(|k| {
            let item = items[k].clone();
            let child_ctx = context.at_path(child_path(&base_path, k));
            let item_resume = resume.as_ref().and_then(|r| r.descend(k));
            let iterations = iterations.clone();
            async move {
                if halted.load(Ordering::SeqCst) || run.abort.is_cancelled() {
                    return (k, None);
                }
                let outcome = self
                    .dispatch(EntryParams {
                        run,
                        entry: body,
                        input: item,
                        step_results,
                        context: &child_ctx,
                        resume: item_resume,
                        time_travel: None,
                        restart: false,
                        iterations,
                    })
                    .await;
                if fail_fast && matches!(&outcome, Ok(o) if o.result.status == StepStatus::Failed) {
                    halted.store(true, Ordering::SeqCst);
                }
                (k, Some(outcome))
            }
        }))
        .buffered(concurrency);

        while let Some((k, item_outcome)) = results.next().await {
            let Some(item_outcome) = item_outcome else {
                continue;
            };
            let item_outcome = item_outcome?;
            items_state.record(k, &item_outcome.result);
            outcome.absorb(item_outcome);
        }
        drop(results);

        let aggregate = items_state.aggregate(outcome.result.clone(), options.failure_policy);
        if let Some(k) = items_state.first_with(StepStatus::Suspended) {
            outcome.delta.push(ContextChange::Suspended {
                step_id: key.clone(),
                path: child_path(&base_path, k),
            });
        }
        tracing::debug!(
            run_id = %run.run_id,
            step_id = %key,
            items = n,
            status = aggregate.status.as_str(),
            "foreach settled"
        );
        outcome.step_results.insert(key, aggregate.clone());
        outcome.result = aggregate;
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Sleep
    // -----------------------------------------------------------------------

    async fn run_sleep(&self, id: &str, timing: SleepTiming<'_>, params: EntryParams<'_>) -> Result<EntryOutcome, EngineError> {
        let run = params.run;
        let path = params.context.execution_path.clone();
        let now = Utc::now();

        let mut started_at = now;
        let mut wake_at = match timing {
            SleepTiming::For(SleepDuration::Fixed(duration)) => wake_after(now, *duration),
            SleepTiming::For(SleepDuration::Computed(compute)) => {
                let eval = eval_context(run, params.input.clone(), params.step_results, params.context, 0);
                wake_after(now, compute(&eval))
            }
            SleepTiming::Until(WakeTime::At(at)) => *at,
            SleepTiming::Until(WakeTime::Computed(compute)) => {
                let eval = eval_context(run, params.input.clone(), params.step_results, params.context, 0);
                compute(&eval)
            }
        };

        if params.restart {
            let parked = params
                .step_results
                .get(id)
                .filter(|r| r.status == StepStatus::Waiting);
            if let Some(parked) = parked {
                if let Some(at) = parked
                    .metadata
                    .get("wakeAt")
                    .and_then(Value::as_i64)
                    .and_then(DateTime::from_timestamp_millis)
                {
                    tracing::info!(run_id = %run.run_id, sleep_id = id, wake_at = %at, "re-arming sleep after restart");
                    wake_at = at;
                    started_at = parked.started_at;
                }
            }
        }

        let mut waiting = StepResult::waiting(Some(params.input.clone()), started_at);
        waiting
            .metadata
            .insert("wakeAt".to_string(), json!(wake_at.timestamp_millis()));
        let mut outcome = EntryOutcome::new(waiting.clone(), run.request_context.clone());
        outcome.step_results.insert(id.to_string(), waiting.clone());
        outcome.delta.push(ContextChange::Active {
            step_id: id.to_string(),
            path: path.clone(),
        });

        self.emit_durable(
            run,
            &path,
            &params.iterations,
            WorkflowEventType::WorkflowStepWaiting,
            json!({
                "id": id,
                "path": path,
                "payload": params.input,
                "startedAt": started_at.timestamp_millis(),
                "status": "waiting",
                "wakeAt": wake_at.timestamp_millis(),
            }),
        )
        .await?;
        self.persist_progress(&params, &outcome, WorkflowRunStatus::Waiting).await?;

        let remaining = (wake_at - Utc::now()).to_std().unwrap_or_default();
        tracing::debug!(run_id = %run.run_id, sleep_id = id, remaining_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX), "sleeping");
        let woke = tokio::select! {
            _ = tokio::time::sleep(remaining) => true,
            _ = run.abort.cancelled() => false,
        };

        let running = waiting.wake();
        outcome.delta.push(ContextChange::Inactive { step_id: id.to_string() });

        if !woke {
            let canceled = running.cancel();
            outcome.step_results.insert(id.to_string(), canceled.clone());
            outcome.result = canceled;
            return Ok(outcome);
        }

        let done = running.succeed(params.input.clone());
        outcome.step_results.insert(id.to_string(), done.clone());
        outcome.result = done.clone();
        self.persist_progress(&params, &outcome, WorkflowRunStatus::Running).await?;

        self.emit_durable(
            run,
            &path,
            &params.iterations,
            WorkflowEventType::WorkflowStepResult,
            json!({
                "id": id,
                "path": path,
                "status": done.status,
                "output": done.output,
                "payload": done.payload,
                "endedAt": done.ended_at.map(|t| t.timestamp_millis()),
            }),
        )
        .await?;
        self.emit_durable(
            run,
            &path,
            &params.iterations,
            WorkflowEventType::WorkflowStepFinish,
            json!({ "id": id, "path": path, "metadata": {} }),
        )
        .await?;
        Ok(outcome)
    }

    /// Persist the run as seen from inside an entry that is still executing.
    async fn persist_progress(
        &self,
        params: &EntryParams<'_>,
        outcome: &EntryOutcome,
        status: WorkflowRunStatus,
    ) -> Result<bool, EngineError> {
        let run = params.run;
        let results = overlay(params.step_results, &outcome.step_results);
        let mut ctx = params.context.clone();
        outcome.delta.apply(&mut ctx);

        self.persister
            .persist_step_update(StepUpdate {
                workflow_id: run.workflow.id(),
                run_id: &run.run_id,
                resource_id: run.resource_id.as_deref(),
                serialized_graph: run.workflow.serialized_graph(),
                step_results: &results,
                context: &ctx,
                workflow_status: status,
                result: None,
                error: None,
                request_context: &run.request_context,
                path: &params.context.execution_path,
                iterations: &params.iterations,
                gate: run.workflow.should_persist_snapshot(),
            })
            .await
    }
}

/// Borrowed view a step attempt runs against.
struct StepView<'a> {
    run: &'a RunScope<'a>,
    step_results: &'a StepResults,
    context: &'a ExecutionContext,
}

fn params_view<'a>(run: &'a RunScope<'a>, step_results: &'a StepResults, context: &'a ExecutionContext) -> StepView<'a> {
    StepView {
        run,
        step_results,
        context,
    }
}

fn validate_step_payloads(step: &Step, input: &Value, resume_data: Option<&Value>) -> Result<(), StepError> {
    if let Some(schema) = step.input_validator() {
        schema
            .validate(input)
            .map_err(|violations| StepError::InvalidInput(violations.join("; ")))?;
    }
    if let (Some(schema), Some(resume_data)) = (step.resume_validator(), resume_data) {
        schema
            .validate(resume_data)
            .map_err(|violations| StepError::InvalidResumeData(violations.join("; ")))?;
    }
    Ok(())
}

/// Settle a parallel or conditional block from its children's results.
///
/// Any failed branch fails the block (first failure in declaration order);
/// otherwise a canceled branch cancels it and a suspended branch suspends
/// it with the first suspended payload. A block whose listed branches all
/// succeeded outputs `{ branchId: output }`.
fn aggregate_branches(children: &[StepFlowEntry], ran: &[usize], view: &StepResults, pending: StepResult) -> StepResult {
    let settled: Vec<(&StepFlowEntry, &StepResult)> = ran
        .iter()
        .filter_map(|&k| {
            let child = &children[k];
            view.get(child.result_key()).map(|r| (child, r))
        })
        .collect();

    if let Some((_, failed)) = settled.iter().find(|(_, r)| r.status == StepStatus::Failed) {
        let error = failed
            .error
            .clone()
            .unwrap_or_else(|| SerializedError::new("Error", "branch failed"));
        return pending.fail(error);
    }
    if settled.iter().any(|(_, r)| r.status == StepStatus::Canceled) {
        return pending.cancel();
    }
    if let Some((_, suspended)) = settled.iter().find(|(_, r)| r.status == StepStatus::Suspended) {
        return pending.suspend(suspended.suspend_payload.clone().unwrap_or(Value::Null));
    }

    let mut outputs = Map::new();
    for (child, result) in settled {
        outputs.insert(
            child.result_key().to_string(),
            result.output.clone().unwrap_or(Value::Null),
        );
    }
    pending.succeed(Value::Object(outputs))
}

// ---------------------------------------------------------------------------
// Foreach bookkeeping
// ---------------------------------------------------------------------------

/// Per-item progress of a foreach entry, persisted in the aggregate's
/// metadata so a resume can skip finished items.
struct ForeachItems {
    statuses: Vec<Option<StepStatus>>,
    outputs: Vec<Value>,
    errors: Vec<Option<SerializedError>>,
    suspend_payloads: Vec<Option<Value>>,
}

impl ForeachItems {
    fn new(n: usize) -> Self {
        Self {
            statuses: vec![None; n],
            outputs: vec![Value::Null; n],
            errors: vec![None; n],
            suspend_payloads: vec![None; n],
        }
    }

    fn restore(&mut self, previous: &StepResult) {
        let n = self.statuses.len();
        if let Some(statuses) = previous.metadata.get("foreachStatuses") {
            if let Ok(statuses) = serde_json::from_value::<Vec<Option<StepStatus>>>(statuses.clone()) {
                for (k, status) in statuses.into_iter().take(n).enumerate() {
                    self.statuses[k] = status;
                }
            }
        }
        if let Some(Value::Array(outputs)) = &previous.output {
            for (k, output) in outputs.iter().take(n).enumerate() {
                self.outputs[k] = output.clone();
            }
        }
        if let Some(Value::Array(payloads)) = previous.metadata.get("foreachSuspendPayloads") {
            for (k, payload) in payloads.iter().take(n).enumerate() {
                if !payload.is_null() {
                    self.suspend_payloads[k] = Some(payload.clone());
                }
            }
        }
    }

    fn record(&mut self, k: usize, result: &StepResult) {
        self.statuses[k] = Some(result.status);
        match result.status {
            StepStatus::Success => {
                self.outputs[k] = result.output.clone().unwrap_or(Value::Null);
                self.suspend_payloads[k] = None;
            }
            StepStatus::Failed => self.errors[k] = result.error.clone(),
            StepStatus::Suspended => self.suspend_payloads[k] = result.suspend_payload.clone(),
            _ => {}
        }
    }

    fn first_with(&self, status: StepStatus) -> Option<usize> {
        self.statuses.iter().position(|s| *s == Some(status))
    }

    fn aggregate(&self, pending: StepResult, policy: ForeachFailurePolicy) -> StepResult {
        let mut result = if let Some(k) = self.first_with(StepStatus::Failed) {
            let first = self.errors[k]
                .clone()
                .unwrap_or_else(|| SerializedError::new("Error", "foreach item failed"));
            match policy {
                ForeachFailurePolicy::FailFast => pending.fail(first),
                ForeachFailurePolicy::CollectErrors => {
                    let failed = self.statuses.iter().filter(|s| **s == Some(StepStatus::Failed)).count();
                    let mut summary = SerializedError::new(
                        "Error",
                        format!("{failed} of {} foreach items failed", self.statuses.len()),
                    );
                    summary.cause = Some(Box::new(first));
                    pending.fail(summary)
                }
            }
        } else if self.first_with(StepStatus::Canceled).is_some() {
            pending.cancel()
        } else if let Some(k) = self.first_with(StepStatus::Suspended) {
            pending.suspend(self.suspend_payloads[k].clone().unwrap_or(Value::Null))
        } else if self.statuses.iter().all(|s| *s == Some(StepStatus::Success)) {
            pending.succeed(Value::Array(self.outputs.clone()))
        } else {
            pending
        };

        result
            .metadata
            .insert("foreachStatuses".to_string(), json!(self.statuses));
        if self.suspend_payloads.iter().any(Option::is_some) {
            result
                .metadata
                .insert("foreachSuspendPayloads".to_string(), json!(self.suspend_payloads));
        }
        if policy == ForeachFailurePolicy::CollectErrors && self.errors.iter().any(Option::is_some) {
            let errors: Vec<Value> = self
                .errors
                .iter()
                .enumerate()
                .filter_map(|(k, e)| e.as_ref().map(|e| json!({ "index": k, "error": e })))
                .collect();
            result.metadata.insert("foreachErrors".to_string(), Value::Array(errors));
        }
        if result.status != StepStatus::Success && result.output.is_none() {
            result.output = Some(Value::Array(self.outputs.clone()));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::InProcessPubSub;
    use crate::repository::memory::InMemoryWorkflowStore;
    use crate::telemetry::RecordingSink;
    use serde_json::Map;
    use std::sync::atomic::AtomicUsize;
    use stepflow_types::config::SnapshotPolicy;
    use stepflow_types::workflow::RetryConfig;

    fn executor() -> EntryExecutor<InMemoryWorkflowStore> {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let durable = Arc::new(DurableOperations::new(store.clone()));
        let persister = Arc::new(SnapshotPersister::new(store, durable.clone(), SnapshotPolicy::Always));
        let publisher = EventPublisher::spawn(Arc::new(InProcessPubSub::default()), 16);
        EntryExecutor::new(persister, durable, publisher, Arc::new(RecordingSink::new()), 1)
    }

    fn scope(workflow: &Workflow) -> RunScope<'_> {
        RunScope {
            workflow,
            run_id: "run-1".to_string(),
            resource_id: None,
            abort: CancellationToken::new(),
            request_context: RequestContext::new(),
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new("wf", "run-1", RetryConfig::default(), Map::new()).at_path(vec![0])
    }

    fn counting(id: &str, calls: Arc<AtomicUsize>) -> Step {
        Step::from_fn(id, move |ctx: StepContext| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                match ctx.input().as_i64() {
                    Some(2) => Err(StepError::failed("two")),
                    other => Ok(json!(other)),
                }
            }
        })
    }

    #[tokio::test]
    async fn test_parallel_merges_branch_state_and_outputs() {
        let writer = |id: &'static str| {
            Step::from_fn(id, move |ctx: StepContext| async move {
                let mut state = ctx.state();
                state.insert(id.to_string(), json!(true));
                ctx.set_state(state);
                Ok(json!(id.len()))
            })
        };
        let workflow = Workflow::builder("wf")
            .parallel([writer("left"), writer("right-hand")])
            .commit()
            .unwrap();
        let run = scope(&workflow);
        let results = StepResults::new(json!({}));
        let ctx = context();

        let outcome = executor()
            .execute_entry(EntryParams {
                run: &run,
                entry: &workflow.graph()[0],
                input: json!({}),
                step_results: &results,
                context: &ctx,
                resume: None,
                time_travel: None,
                restart: false,
                iterations: Vec::new(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.result.status, StepStatus::Success);
        assert_eq!(outcome.result.output, Some(json!({ "left": 4, "right-hand": 10 })));

        let mut applied = ctx.clone();
        outcome.delta.apply(&mut applied);
        assert_eq!(applied.state["left"], json!(true));
        assert_eq!(applied.state["right-hand"], json!(true));
        assert!(applied.active_steps_path.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let workflow = Workflow::builder("wf")
            .then(counting("a", calls.clone()))
            .commit()
            .unwrap();
        let run = scope(&workflow);
        run.abort.cancel();
        let results = StepResults::new(json!(1));
        let ctx = context();

        let outcome = executor()
            .execute_entry(EntryParams {
                run: &run,
                entry: &workflow.graph()[0],
                input: json!(1),
                step_results: &results,
                context: &ctx,
                resume: None,
                time_travel: None,
                restart: false,
                iterations: Vec::new(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.result.status, StepStatus::Canceled);
        assert_eq!(outcome.step_results["a"].status, StepStatus::Canceled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_foreach_fail_fast_skips_later_items() {
        let calls = Arc::new(AtomicUsize::new(0));
        let workflow = Workflow::builder("wf")
            .foreach(counting("item", calls.clone()), ForeachOptions::concurrency(1))
            .commit()
            .unwrap();
        let run = scope(&workflow);
        let results = StepResults::new(json!([1, 2, 3]));
        let ctx = context();

        let outcome = executor()
            .execute_entry(EntryParams {
                run: &run,
                entry: &workflow.graph()[0],
                input: json!([1, 2, 3]),
                step_results: &results,
                context: &ctx,
                resume: None,
                time_travel: None,
                restart: false,
                iterations: Vec::new(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.result.status, StepStatus::Failed);
        assert_eq!(outcome.result.error.as_ref().unwrap().message, "two");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            outcome.result.metadata["foreachStatuses"],
            json!(["success", "failed", null])
        );
    }

    #[test]
    fn test_resume_params_descend_consumes_one_level() {
        let resume = ResumeParams {
            step_id: "b".into(),
            path: vec![1, 0],
            resume_data: json!(true),
            label: None,
        };
        assert_eq!(resume.descend(0), None);
        let child = resume.descend(1).unwrap();
        assert_eq!(child.path, vec![0]);
        assert_eq!(child.descend(0).unwrap().path, Vec::<usize>::new());
    }

    #[test]
    fn test_wake_after_saturates_out_of_range_durations() {
        let now = Utc::now();
        assert_eq!(wake_after(now, std::time::Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            wake_after(now, std::time::Duration::from_secs(u64::MAX / 2)),
            DateTime::<Utc>::MAX_UTC
        );
        assert_eq!(
            wake_after(now, std::time::Duration::from_millis(1500)),
            now + TimeDelta::milliseconds(1500)
        );
    }
}
