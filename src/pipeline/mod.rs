//! The interceptor pipeline wrapped around every RPC.
//!
//! Each stage is a tower [`Layer`] over `http::Request`/`http::Response`, so the
//! same chain covers unary and streaming methods. [`Pipeline`] fixes the order,
//! outermost first:
//!
//! 1. [`TraceLayer`] opens the `rpc` span and creates the [`CallContext`]
//! 2. [`MetricsLayer`] counts the attempt and records outcome and latency
//! 3. [`LoggingLayer`] emits the start and completion records
//! 4. [`AuthLayer`] resolves the caller or rejects the call
//! 5. [`CorrelationLayer`] assigns the correlation id
//! 6. [`RecoveryLayer`] turns panics below it into `Internal`
//! 7. [`RateLimitLayer`] admits the call and bounds it by its deadline
//!
//! Outcome-recording stages take the final status when the response body
//! finishes, so a stream that ends in an error trailer is recorded with that
//! error and its full duration.
//!
//! [`CallContext`]: crate::context::CallContext

mod auth;
mod completion;
mod correlation;
mod logging;
mod metrics;
mod rate_limit;
mod recovery;
mod trace;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tonic::Status;
use tower::{Layer, ServiceBuilder};

pub use auth::{AuthLayer, AuthService, MethodAllowList};
pub use correlation::{CorrelationLayer, CorrelationService};
pub use logging::{LoggingLayer, LoggingService};
pub use metrics::{MetricsLayer, MetricsService, UNKNOWN_METHOD};
pub use rate_limit::{RateLimitLayer, RateLimitScope, RateLimitService};
pub use recovery::{RecoveryLayer, RecoveryService};
pub use trace::{TraceLayer, TraceService};

use crate::context::DEFAULT_CALL_TIMEOUT;
use crate::identity::TokenVerifier;
use crate::limiter::Admission;
use crate::telemetry::{CallMetrics, SharedMetrics};
use crate::{Error, Result};

/// Response body produced by tonic services and by every pipeline stage.
pub type BoxBody = tonic::body::BoxBody;

/// Future returned by every pipeline service.
pub type ResponseFuture<E> = BoxFuture<'static, std::result::Result<http::Response<BoxBody>, E>>;

/// Builds a trailers-only gRPC response carrying `status`.
pub(crate) fn status_response(status: Status) -> http::Response<BoxBody> {
    status.into_http()
}

/// The full, ordered interceptor chain.
///
/// Built once per server instance by [`PipelineBuilder`] and handed to
/// `tonic::transport::Server::layer`.
#[derive(Clone)]
pub struct Pipeline {
    trace: TraceLayer,
    metrics: MetricsLayer,
    logging: LoggingLayer,
    auth: AuthLayer,
    correlation: CorrelationLayer,
    recovery: RecoveryLayer,
    rate_limit: RateLimitLayer,
}

impl Pipeline {
    /// Starts building a pipeline.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Metrics registry shared by this pipeline's metrics stage.
    pub fn metrics(&self) -> &SharedMetrics {
        self.metrics.registry()
    }
}

impl<S> Layer<S> for Pipeline {
    type Service = TraceService<
        MetricsService<
            LoggingService<AuthService<CorrelationService<RecoveryService<RateLimitService<S>>>>>,
        >,
    >;

    fn layer(&self, inner: S) -> Self::Service {
        ServiceBuilder::new()
            .layer(self.trace.clone())
            .layer(self.metrics.clone())
            .layer(self.logging.clone())
            .layer(self.auth.clone())
            .layer(self.correlation.clone())
            .layer(self.recovery.clone())
            .layer(self.rate_limit.clone())
            .service(inner)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("trace", &self.trace)
            .field("allow_list", self.auth.allow_list())
            .field("scope", &self.rate_limit.scope())
            .finish_non_exhaustive()
    }
}

/// Assembles a [`Pipeline`].
///
/// The token verifier and the admission gate are required. Without an explicit
/// registry a fresh [`CallMetrics`] is created for this pipeline.
pub struct PipelineBuilder {
    service_name: String,
    environment: String,
    call_timeout: Duration,
    allow_list: HashSet<String>,
    known_methods: HashSet<String>,
    verifier: Option<TokenVerifier>,
    admission: Option<Arc<dyn Admission>>,
    scope: RateLimitScope,
    metrics: Option<SharedMetrics>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            environment: "development".to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            allow_list: HashSet::new(),
            known_methods: HashSet::new(),
            verifier: None,
            admission: None,
            scope: RateLimitScope::Global,
            metrics: None,
        }
    }
}

impl PipelineBuilder {
    /// `service.name` recorded on every span.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// `deployment.environment` recorded on every span.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Upper bound on any call's deadline.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Methods, as `<service>/<method>`, that skip identity resolution.
    pub fn allow_list<I, T>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.allow_list = methods.into_iter().map(Into::into).collect();
        self
    }

    /// Methods, as `<service>/<method>`, that the dispatch table serves. Metrics
    /// label every other path as [`UNKNOWN_METHOD`].
    pub fn known_methods<I, T>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.known_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    /// Verifier for bearer credentials.
    pub fn verifier(mut self, verifier: TokenVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Admission gate and the key it is consulted with.
    pub fn admission(mut self, admission: Arc<dyn Admission>, scope: RateLimitScope) -> Self {
        self.admission = Some(admission);
        self.scope = scope;
        self
    }

    /// Metrics registry to record into.
    pub fn metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    /// Returns [`Error::Startup`] if a required part is missing or the metrics
    /// registry cannot be created.
    pub fn build(self) -> Result<Pipeline> {
        let verifier = self
            .verifier
            .ok_or_else(|| Error::Startup("pipeline requires a token verifier".to_string()))?;
        let admission = self
            .admission
            .ok_or_else(|| Error::Startup("pipeline requires an admission gate".to_string()))?;
        if self.call_timeout.is_zero() {
            return Err(Error::Startup("call timeout must be positive".to_string()));
        }

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(CallMetrics::new()?),
        };

        Ok(Pipeline {
            trace: TraceLayer::new(&self.service_name, &self.environment, self.call_timeout),
            metrics: MetricsLayer::new(metrics, self.known_methods),
            logging: LoggingLayer::new(),
            auth: AuthLayer::new(MethodAllowList::new(self.allow_list), verifier),
            correlation: CorrelationLayer::new(),
            recovery: RecoveryLayer::new(),
            rate_limit: RateLimitLayer::new(admission, self.scope),
        })
    }
}
