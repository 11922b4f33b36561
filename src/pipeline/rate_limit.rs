use std::sync::Arc;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tonic::Status;
use tower::{Layer, Service};

use super::{status_response, BoxBody, ResponseFuture};
use crate::context::context_mut;
use crate::limiter::Admission;
use crate::Error;

const GLOBAL_KEY: &str = "global";
const ANONYMOUS_KEY: &str = "anonymous";

/// Which key the admission gate is consulted with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// Every call draws from one shared bucket.
    #[default]
    Global,
    /// Each resolved subject has its own bucket; anonymous calls share one.
    PerCaller,
}

/// Admission control, innermost stage before the handler.
///
/// Waiting for admission and running the handler are both bounded by the call's
/// deadline. Dropping the call while it waits never leaves the bucket half
/// updated: acquisition does not await inside its critical section.
#[derive(Clone)]
pub struct RateLimitLayer {
    admission: Arc<dyn Admission>,
    scope: RateLimitScope,
}

impl RateLimitLayer {
    /// Creates the layer.
    pub fn new(admission: Arc<dyn Admission>, scope: RateLimitScope) -> Self {
        Self { admission, scope }
    }

    pub(crate) fn scope(&self) -> RateLimitScope {
        self.scope
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            admission: self.admission.clone(),
            scope: self.scope,
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    admission: Arc<dyn Admission>,
    scope: RateLimitScope,
}

impl<S, B> Service<http::Request<B>> for RateLimitService<S>
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
        let deadline = ctx.deadline;
        let method = ctx.method.clone();
        let key = match self.scope {
            RateLimitScope::Global => GLOBAL_KEY.to_string(),
            RateLimitScope::PerCaller => ctx
                .caller
                .as_ref()
                .map_or_else(|| ANONYMOUS_KEY.to_string(), |c| c.subject_id.clone()),
        };

        let admission = self.admission.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let admitted = tokio::time::timeout_at(deadline, admission.try_acquire(&key))
                .await
                .unwrap_or(Err(Error::DeadlineExceeded));

            if let Err(err) = admitted {
                tracing::warn!(%method, %key, "call not admitted: {err}");
                return Ok(status_response(Status::from(err)));
            }

            match tokio::time::timeout_at(deadline, inner.call(req)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(%method, "deadline elapsed before handler finished");
                    Ok(status_response(Status::from(Error::DeadlineExceeded)))
                }
            }
        })
    }
}
