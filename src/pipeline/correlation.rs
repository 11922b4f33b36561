use std::task::{Context, Poll};

use http::HeaderValue;
use tower::{Layer, Service};

use super::{BoxBody, ResponseFuture};
use crate::context::{context_mut, CORRELATION_ID_HEADER};

const MAX_CORRELATION_ID_LEN: usize = 128;

/// Propagates the inbound `x-correlation-id` or generates a UUID v4, stores it in
/// the call context, and echoes it on the response.
#[derive(Clone, Copy, Debug, Default)]
pub struct CorrelationLayer;

impl CorrelationLayer {
    /// Creates the layer.
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationService { inner }
    }
}

/// Service produced by [`CorrelationLayer`].
#[derive(Clone, Debug)]
pub struct CorrelationService<S> {
    inner: S,
}

/// Accepts a caller-supplied id only if it is short, printable ASCII.
fn inbound_id(value: &HeaderValue) -> Option<String> {
    let value = value.to_str().ok()?.trim();
    let acceptable = !value.is_empty()
        && value.len() <= MAX_CORRELATION_ID_LEN
        && value.bytes().all(|b| b.is_ascii_graphic());

    acceptable.then(|| value.to_string())
}

impl<S, B> Service<http::Request<B>> for CorrelationService<S>
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
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(inbound_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        tracing::Span::current().record("correlation_id", correlation_id.as_str());
        context_mut(&mut req).correlation_id = Some(correlation_id.clone());

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            if let Ok(value) = HeaderValue::from_str(&correlation_id) {
                response.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
            Ok::<_, S::Error>(response)
        })
    }
}
