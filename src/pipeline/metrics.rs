use std::collections::HashSet;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tonic::Code;
use tower::{Layer, Service};

use super::completion::on_completion;
use super::{BoxBody, ResponseFuture};
use crate::context::context_mut;
use crate::telemetry::SharedMetrics;

/// Label recorded for any path outside the dispatch table.
pub const UNKNOWN_METHOD: &str = "unknown";

/// Counts each call at entry and records its status and latency at exit.
///
/// Only methods in the known set get their own series, so arbitrary request
/// paths cannot grow the registry.
#[derive(Clone, Debug)]
pub struct MetricsLayer {
    metrics: SharedMetrics,
    known: Arc<HashSet<String>>,
}

impl MetricsLayer {
    /// Records into `metrics`, labelling calls to `known` methods by name.
    pub fn new(metrics: SharedMetrics, known: HashSet<String>) -> Self {
        Self {
            metrics,
            known: Arc::new(known),
        }
    }

    pub(crate) fn registry(&self) -> &SharedMetrics {
        &self.metrics
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            metrics: self.metrics.clone(),
            known: self.known.clone(),
        }
    }
}

/// Service produced by [`MetricsLayer`].
#[derive(Clone, Debug)]
pub struct MetricsService<S> {
    inner: S,
    metrics: SharedMetrics,
    known: Arc<HashSet<String>>,
}

impl<S> MetricsService<S> {
    fn label(&self, method: &str) -> String {
        if self.known.contains(method) {
            method.to_string()
        } else {
            UNKNOWN_METHOD.to_string()
        }
    }
}

impl<S, B> Service<http::Request<B>> for MetricsService<S>
where
    S: Service<http::Request<B>, Response = http::Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<B>) -> Self::Future {
        let method = self.label(&context_mut(&mut req).method);
        self.metrics.record_started(&method);

        let metrics = self.metrics.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let started = Instant::now();
            match inner.call(req).await {
                Ok(response) => Ok(on_completion(response, move |code| {
                    metrics.record_handled(&method, code, started.elapsed());
                })),
                Err(err) => {
                    metrics.record_handled(&method, Code::Unknown, started.elapsed());
                    Err(err)
                }
            }
        })
    }
}
