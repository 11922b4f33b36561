use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};

use futures::FutureExt;
use tonic::Status;
use tower::{Layer, Service};

use super::{status_response, BoxBody, ResponseFuture};
use crate::context::context_mut;

/// Fault boundary around the rate limiter and the handler.
///
/// A panic while creating or polling the inner future is logged with the call's
/// method and correlation id and answered with a generic `Internal`. The panic
/// hook installed by [`crate::telemetry::install_panic_hook`] records the backtrace.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryLayer;

impl RecoveryLayer {
    /// Creates the layer.
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService { inner }
    }
}

/// Service produced by [`RecoveryLayer`].
#[derive(Clone, Debug)]
pub struct RecoveryService<S> {
    inner: S,
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

fn recovered(
    method: &str,
    correlation_id: Option<&str>,
    panic: Box<dyn Any + Send>,
) -> http::Response<BoxBody> {
    tracing::error!(
        %method,
        correlation_id = correlation_id.unwrap_or("-"),
        panic = panic_message(panic.as_ref()),
        "handler panicked; returning internal error"
    );
    status_response(Status::internal("internal error"))
}

impl<S, B> Service<http::Request<B>> for RecoveryService<S>
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
        let ctx = context_mut(&mut req);
        let method = ctx.method.clone();
        let correlation_id = ctx.correlation_id.clone();

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(req))) {
            Ok(future) => future,
            Err(panic) => {
                let response = recovered(&method, correlation_id.as_deref(), panic);
                return Box::pin(async move { Ok(response) });
            }
        };

        Box::pin(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Ok(recovered(&method, correlation_id.as_deref(), panic)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_reads_common_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(payload.as_ref()), "owned boom");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
