//! Tracing subscriber for processes hosting a stepflow engine.
//!
//! The engine opens a `workflow.run` span (`workflow_id`, `run_id`) around
//! every run it drives and a nested `workflow.entry` span (`entry_id`,
//! `path`, `iterations`) around every graph entry. The subscriber installed
//! here logs those spans on close, so each run and entry reports its
//! duration, and can optionally export them to OpenTelemetry.
//!
//! ```no_run
//! use stepflow_observe::{LogFormat, TracingOptions};
//!
//! let options = TracingOptions {
//!     format: LogFormat::Json,
//!     ..TracingOptions::default()
//! };
//! stepflow_observe::init_tracing(&options).unwrap();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Subscriber;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when neither `RUST_LOG` nor [`TracingOptions::filter`] is set.
pub const DEFAULT_FILTER: &str = "stepflow_core=info,stepflow_infra=info";

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Line format of the log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines with targets.
    #[default]
    Pretty,
    /// One JSON object per event, carrying the enclosing run/entry spans.
    Json,
}

impl LogFormat {
    /// `"json"` (any case) selects [`LogFormat::Json`]; anything else is pretty.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TracingOptions {
    pub format: LogFormat,
    /// Export spans to OpenTelemetry through the stdout exporter.
    pub otel: bool,
    /// Filter directives used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

impl TracingOptions {
    /// Options from `STEPFLOW_LOG_FORMAT`, `STEPFLOW_OTEL` and
    /// `STEPFLOW_LOG_FILTER`.
    pub fn from_env() -> Self {
        Self {
            format: std::env::var("STEPFLOW_LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
            otel: std::env::var("STEPFLOW_OTEL").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
            filter: std::env::var("STEPFLOW_LOG_FILTER").ok(),
        }
    }
}

/// `RUST_LOG` wins over configured directives, which win over
/// [`DEFAULT_FILTER`].
fn resolve_filter(from_env: Option<String>, configured: Option<&str>) -> Result<EnvFilter, ParseError> {
    match (from_env, configured) {
        (Some(directives), _) => EnvFilter::try_new(directives),
        (None, Some(directives)) => EnvFilter::try_new(directives),
        (None, None) => EnvFilter::try_new(DEFAULT_FILTER),
    }
}

/// The formatting layer, reporting `workflow.run` and `workflow.entry`
/// spans when they close.
fn fmt_layer<S, W>(format: LogFormat, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(writer)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(writer)
            .boxed(),
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails on unparseable filter directives or when a global subscriber is
/// already set.
pub fn init_tracing(options: &TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let filter = resolve_filter(std::env::var("RUST_LOG").ok(), options.filter.as_deref())?;

    let otel_layer = if options.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("stepflow");
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt_layer(options.format, std::io::stdout))
        .with(otel_layer)
        .with(filter)
        .try_init()?;
    Ok(())
}

/// Flush pending spans and shut down the OpenTelemetry provider, if any.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
