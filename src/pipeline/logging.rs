use std::task::{Context, Poll};
use std::time::Instant;

use tonic::Code;
use tower::{Layer, Service};

use super::completion::on_completion;
use super::{BoxBody, ResponseFuture};
use crate::context::context_mut;

/// Emits a `debug` record when a call starts and one completion record when it
/// ends, with the severity chosen by [`severity`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingLayer;

impl LoggingLayer {
    /// Creates the layer.
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService { inner }
    }
}

/// Service produced by [`LoggingLayer`].
#[derive(Clone, Debug)]
pub struct LoggingService<S> {
    inner: S,
}

#[derive(Debug, PartialEq, Eq)]
enum Severity {
    Info,
    Warn,
    Error,
}

/// Client-class failures are warnings; everything else that is not `Ok` is an error.
fn severity(code: Code) -> Severity {
    match code {
        Code::Ok => Severity::Info,
        Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::Unauthenticated
        | Code::PermissionDenied
        | Code::ResourceExhausted
        | Code::Unimplemented
        | Code::Cancelled
        | Code::DeadlineExceeded => Severity::Warn,
        _ => Severity::Error,
    }
}

fn log_completion(method: &str, code: Code, elapsed_ms: f64) {
    match severity(code) {
        Severity::Info => {
            tracing::info!(%method, ?code, elapsed_ms, "call completed");
        }
        Severity::Warn => {
            tracing::warn!(%method, ?code, elapsed_ms, "call rejected");
        }
        Severity::Error => {
            tracing::error!(%method, ?code, elapsed_ms, "call failed");
        }
    }
}

impl<S, B> Service<http::Request<B>> for LoggingService<S>
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
        let method = context_mut(&mut req).method.clone();
        tracing::debug!(%method, "call started");

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let started = Instant::now();
            let span = tracing::Span::current();

            match inner.call(req).await {
                Ok(response) => Ok(on_completion(response, move |code| {
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    span.in_scope(|| log_completion(&method, code, elapsed_ms));
                })),
                Err(err) => {
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    tracing::error!(%method, elapsed_ms, "call failed in transport");
                    Err(err)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_follows_status_class() {
        assert_eq!(severity(Code::Ok), Severity::Info);
        assert_eq!(severity(Code::Unauthenticated), Severity::Warn);
        assert_eq!(severity(Code::ResourceExhausted), Severity::Warn);
        assert_eq!(severity(Code::Internal), Severity::Error);
        assert_eq!(severity(Code::Unavailable), Severity::Error);
    }
}
