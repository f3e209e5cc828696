//! User steps and the context they execute with.
//!
//! A [`Step`] pairs an id and optional schemas with a [`StepHandler`].
//! Handlers are usually closures (see [`Step::from_fn`]). While running, a
//! handler talks to the engine through its [`StepContext`]: it reads its
//! input, the run's state and earlier step results, and may update state,
//! suspend awaiting a resume, or bail out of the whole run.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use stepflow_types::workflow::{SerializedStep, StepResults};
use tokio_util::sync::CancellationToken;

use super::error::StepError;
use super::schema::Schema;
use crate::request_context::RequestContext;

// ---------------------------------------------------------------------------
// StepHandler
// ---------------------------------------------------------------------------

/// Executes the body of a step.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// See [`StepHandlerDyn`] for the object-safe wrapper the engine stores.
pub trait StepHandler: Send + Sync + 'static {
    fn execute(&self, ctx: StepContext) -> impl Future<Output = Result<Value, StepError>> + Send;
}

/// Object-safe version of [`StepHandler`] with a boxed future.
///
/// Blanket-implemented for every `StepHandler`, so `Arc<dyn StepHandlerDyn>`
/// can hold handlers of different concrete types.
pub trait StepHandlerDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>> {
        Box::pin(self.execute(ctx))
    }
}

/// Adapter turning an async closure into a [`StepHandler`].
pub struct FnHandler<F>(F);

impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    fn execute(&self, ctx: StepContext) -> impl Future<Output = Result<Value, StepError>> + Send {
        (self.0)(ctx)
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A unit of user work in the step graph.
#[derive(Clone)]
pub struct Step {
    id: String,
    description: Option<String>,
    input_schema: Option<Schema>,
    output_schema: Option<Schema>,
    resume_schema: Option<Schema>,
    retries: Option<u32>,
    handler: Arc<dyn StepHandlerDyn>,
}

impl Step {
    pub fn new(id: impl Into<String>, handler: impl StepHandler) -> Self {
        Self {
            id: id.into(),
            description: None,
            input_schema: None,
            output_schema: None,
            resume_schema: None,
            retries: None,
            handler: Arc::new(handler),
        }
    }

    /// Build a step from an async closure.
    pub fn from_fn<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self::new(id, FnHandler(f))
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn input_schema(mut self, schema: impl Into<Schema>) -> Self {
        self.input_schema = Some(schema.into());
        self
    }

    pub fn output_schema(mut self, schema: impl Into<Schema>) -> Self {
        self.output_schema = Some(schema.into());
        self
    }

    pub fn resume_schema(mut self, schema: impl Into<Schema>) -> Self {
        self.resume_schema = Some(schema.into());
        self
    }

    /// Per-step retry count, overriding the run-wide policy.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn retry_override(&self) -> Option<u32> {
        self.retries
    }

    pub fn input_validator(&self) -> Option<&Schema> {
        self.input_schema.as_ref()
    }

    pub fn output_validator(&self) -> Option<&Schema> {
        self.output_schema.as_ref()
    }

    pub fn resume_validator(&self) -> Option<&Schema> {
        self.resume_schema.as_ref()
    }

    pub fn handler(&self) -> &dyn StepHandlerDyn {
        self.handler.as_ref()
    }

    pub fn serialize(&self) -> SerializedStep {
        SerializedStep {
            id: self.id.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.as_ref().map(|s| s.document().clone()),
            output_schema: self.output_schema.as_ref().map(|s| s.document().clone()),
            resume_schema: self.resume_schema.as_ref().map(|s| s.document().clone()),
            retries: self.retries,
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// What a handler asked the engine to do besides returning a value.
#[derive(Debug, Default)]
pub(crate) struct StepControl {
    pub(crate) suspended: Option<Suspension>,
    pub(crate) bailed: Option<Value>,
    pub(crate) state: Option<Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub(crate) struct Suspension {
    pub(crate) payload: Value,
    pub(crate) label: Option<String>,
}

/// Handle passed to a running step.
#[derive(Clone)]
pub struct StepContext {
    run_id: String,
    workflow_id: String,
    step_id: String,
    input: Value,
    resume_data: Option<Value>,
    state: Map<String, Value>,
    step_results: Arc<StepResults>,
    request_context: RequestContext,
    abort: CancellationToken,
    retry_count: u32,
    control: Arc<Mutex<StepControl>>,
}

/// Everything needed to build a [`StepContext`].
pub(crate) struct StepContextParts {
    pub(crate) run_id: String,
    pub(crate) workflow_id: String,
    pub(crate) step_id: String,
    pub(crate) input: Value,
    pub(crate) resume_data: Option<Value>,
    pub(crate) state: Map<String, Value>,
    pub(crate) step_results: Arc<StepResults>,
    pub(crate) request_context: RequestContext,
    pub(crate) abort: CancellationToken,
    pub(crate) retry_count: u32,
}

impl StepContext {
    pub(crate) fn new(parts: StepContextParts, control: Arc<Mutex<StepControl>>) -> Self {
        Self {
            run_id: parts.run_id,
            workflow_id: parts.workflow_id,
            step_id: parts.step_id,
            input: parts.input,
            resume_data: parts.resume_data,
            state: parts.state,
            step_results: parts.step_results,
            request_context: parts.request_context,
            abort: parts.abort,
            retry_count: parts.retry_count,
            control,
        }
    }

    fn control(&self) -> std::sync::MutexGuard<'_, StepControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// The entry's input (previous entry's output, or the foreach item).
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Deserialize the input into a typed value.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        serde_json::from_value(self.input.clone()).map_err(|e| StepError::InvalidInput(e.to_string()))
    }

    /// The run's original input.
    pub fn init_data(&self) -> &Value {
        &self.step_results.input
    }

    /// Data supplied by the caller when this step is being resumed.
    pub fn resume_data(&self) -> Option<&Value> {
        self.resume_data.as_ref()
    }

    /// Workflow state as of this step's start, including earlier `set_state`
    /// calls made by this step.
    pub fn state(&self) -> Map<String, Value> {
        self.control().state.clone().unwrap_or_else(|| self.state.clone())
    }

    /// Replace the workflow state.
    pub fn set_state(&self, state: Map<String, Value>) {
        self.control().state = Some(state);
    }

    /// Output of an earlier successful step.
    pub fn get_step_result(&self, step_id: &str) -> Option<&Value> {
        self.step_results
            .get(step_id)
            .filter(|r| r.is_success())
            .and_then(|r| r.output.as_ref())
    }

    /// Park this step until the run is resumed.
    ///
    /// Return the value of this call from the handler; the step settles as
    /// `suspended` with `payload` regardless of the returned value.
    pub fn suspend(&self, payload: Value) -> Result<Value, StepError> {
        self.record_suspension(payload, None)
    }

    /// Like [`suspend`](Self::suspend), registering `label` as a resume target.
    pub fn suspend_with_label(&self, payload: Value, label: impl Into<String>) -> Result<Value, StepError> {
        self.record_suspension(payload, Some(label.into()))
    }

    fn record_suspension(&self, payload: Value, label: Option<String>) -> Result<Value, StepError> {
        self.control().suspended = Some(Suspension { payload, label });
        Ok(Value::Null)
    }

    /// End the whole run successfully with `result`, skipping every later entry.
    pub fn bail(&self, result: Value) -> Result<Value, StepError> {
        self.control().bailed = Some(result.clone());
        Ok(result)
    }

    pub fn request_context(&self) -> &RequestContext {
        &self.request_context
    }

    /// Cancelled when the run is cancelled.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Zero on the first attempt, then one per retry.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("run_id", &self.run_id)
            .field("step_id", &self.step_id)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}
