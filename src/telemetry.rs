//! Logging, panic reporting, and per-server metrics.

use std::backtrace::Backtrace;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics::{Key, Label, Level, Metadata, Recorder};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tonic::Code;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

const STARTED_TOTAL: &str = "rpc_server_started_total";
const HANDLED_TOTAL: &str = "rpc_server_handled_total";
const HANDLING_SECONDS: &str = "rpc_server_handling_seconds";

const LATENCY_BUCKETS: [f64; 12] = [
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Installs the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to `default_filter`. Output is
/// newline-delimited JSON when `json` is set.
///
/// # Errors
/// Returns [`Error::Startup`] if a subscriber is already installed.
pub fn init_tracing(default_filter: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| Error::Startup(format!("failed to install tracing subscriber: {e}")))
}

/// Routes panic reports through `tracing`, with location and a captured backtrace.
///
/// The pipeline's recovery stage turns the panic into an `Internal` response; this
/// hook is where the full diagnostic lands on the server side.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        tracing::error!(panic = %info, %backtrace, "panic while serving");
    }));
}

/// Call counters and latency histograms for one server instance.
///
/// Backed by its own [`PrometheusRecorder`], which is never installed as the
/// process-wide recorder; two servers in one process keep separate series.
pub struct CallMetrics {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl CallMetrics {
    /// Creates a registry that is only readable through [`CallMetrics::render`].
    ///
    /// # Errors
    /// Returns [`Error::Startup`] if the histogram buckets are rejected.
    pub fn new() -> Result<Self> {
        let recorder = Self::builder()?.build_recorder();
        let handle = recorder.handle();
        Ok(Self { recorder, handle })
    }

    /// Creates a registry and spawns a Prometheus scrape endpoint on `addr`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`Error::Startup`] if the exporter cannot be built or bound.
    pub fn with_exporter(addr: SocketAddr) -> Result<Self> {
        let (recorder, exporter) = Self::builder()?
            .with_http_listener(addr)
            .build()
            .map_err(|e| Error::Startup(format!("failed to build metrics exporter: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = exporter.await {
                tracing::error!("metrics exporter stopped: {e:?}");
            }
        });

        let handle = recorder.handle();
        tracing::info!("metrics exporter listening on {addr}");
        Ok(Self { recorder, handle })
    }

    fn builder() -> Result<PrometheusBuilder> {
        PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(HANDLING_SECONDS.to_string()), &LATENCY_BUCKETS)
            .map_err(|e| Error::Startup(format!("invalid metrics buckets: {e}")))
    }

    /// Counts one call attempt on `method`.
    pub fn record_started(&self, method: &str) {
        let key = Key::from_parts(STARTED_TOTAL, vec![Label::new("method", method.to_string())]);
        self.recorder
            .register_counter(&key, &metadata())
            .increment(1);
    }

    /// Records the outcome and latency of one call on `method`.
    pub fn record_handled(&self, method: &str, code: Code, elapsed: Duration) {
        let handled = Key::from_parts(
            HANDLED_TOTAL,
            vec![
                Label::new("method", method.to_string()),
                Label::new("code", format!("{code:?}")),
            ],
        );
        self.recorder
            .register_counter(&handled, &metadata())
            .increment(1);

        let latency = Key::from_parts(
            HANDLING_SECONDS,
            vec![Label::new("method", method.to_string())],
        );
        self.recorder
            .register_histogram(&latency, &metadata())
            .record(elapsed.as_secs_f64());
    }

    /// Prometheus text exposition of every series recorded so far.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl std::fmt::Debug for CallMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallMetrics").finish_non_exhaustive()
    }
}

/// Shared handle passed into the pipeline.
pub type SharedMetrics = Arc<CallMetrics>;

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}
