use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};
use tracing::field::Empty;
use tracing::Instrument;

use super::completion::on_completion;
use super::{BoxBody, ResponseFuture};
use crate::context::CallContext;

/// Opens one `rpc` span per call and creates the call's [`CallContext`].
///
/// Fields known only later (`correlation_id`, `subject_id`) are declared empty here
/// and recorded by the inner stages once resolved.
#[derive(Clone, Debug)]
pub struct TraceLayer {
    service_name: Arc<str>,
    environment: Arc<str>,
    call_timeout: Duration,
}

impl TraceLayer {
    /// Creates the layer. `call_timeout` caps every call's deadline.
    pub fn new(service_name: &str, environment: &str, call_timeout: Duration) -> Self {
        Self {
            service_name: service_name.into(),
            environment: environment.into(),
            call_timeout,
        }
    }
}

impl<S> Layer<S> for TraceLayer {
    type Service = TraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Service produced by [`TraceLayer`].
#[derive(Clone, Debug)]
pub struct TraceService<S> {
    inner: S,
    layer: TraceLayer,
}

impl<S, B> Service<http::Request<B>> for TraceService<S>
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
        let ctx = CallContext::from_request(&req, self.layer.call_timeout);
        let span = tracing::info_span!(
            "rpc",
            rpc.method = %ctx.method,
            service.name = %self.layer.service_name,
            deployment.environment = %self.layer.environment,
            correlation_id = Empty,
            subject_id = Empty,
            rpc.grpc.status_code = Empty,
        );
        req.extensions_mut().insert(ctx);

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(
            async move {
                let span = tracing::Span::current();
                let response = inner.call(req).await?;
                Ok::<_, S::Error>(on_completion(response, move |code| {
                    span.record("rpc.grpc.status_code", code as i32);
                }))
            }
            .instrument(span),
        )
    }
}
