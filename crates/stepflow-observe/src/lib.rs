//! Observability setup for processes hosting a stepflow engine: a tracing
//! subscriber that reports run and entry spans, with optional
//! OpenTelemetry export.

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};
