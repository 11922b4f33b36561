use std::collections::HashSet;
use std::sync::Arc;
use std::task::{Context, Poll};

use tonic::Status;
use tower::{Layer, Service};

use super::{status_response, BoxBody, ResponseFuture};
use crate::context::{context_mut, Caller, AUTHORIZATION_HEADER};
use crate::identity::{bearer_token, TokenVerifier};
use crate::Error;

/// Methods exempt from identity resolution. Read-only once built.
#[derive(Clone, Debug, Default)]
pub struct MethodAllowList(Arc<HashSet<String>>);

impl MethodAllowList {
    /// Wraps a set of `<service>/<method>` names.
    pub fn new(methods: HashSet<String>) -> Self {
        Self(Arc::new(methods))
    }

    /// Whether `method` skips identity resolution.
    pub fn contains(&self, method: &str) -> bool {
        self.0.contains(method)
    }
}

/// Resolves the caller from the `authorization` metadata.
///
/// Allow-listed methods pass without identity. Every other call needs a bearer
/// credential the [`TokenVerifier`] accepts; otherwise the call ends here with
/// `Unauthenticated` and nothing below this stage runs.
#[derive(Clone)]
pub struct AuthLayer {
    allow_list: MethodAllowList,
    verifier: TokenVerifier,
}

impl AuthLayer {
    /// Creates the layer.
    pub fn new(allow_list: MethodAllowList, verifier: TokenVerifier) -> Self {
        Self {
            allow_list,
            verifier,
        }
    }

    pub(crate) fn allow_list(&self) -> &MethodAllowList {
        &self.allow_list
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            allow_list: self.allow_list.clone(),
            verifier: self.verifier.clone(),
        }
    }
}

/// Service produced by [`AuthLayer`].
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    allow_list: MethodAllowList,
    verifier: TokenVerifier,
}

impl<S> AuthService<S> {
    fn resolve<B>(&self, req: &http::Request<B>) -> Result<Caller, Error> {
        let token = req
            .headers()
            .get(AUTHORIZATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
            .ok_or_else(|| Error::Authentication("missing credential".to_string()))?;

        self.verifier.verify(token).map(Caller::from)
    }
}

impl<S, B> Service<http::Request<B>> for AuthService<S>
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

        if !self.allow_list.contains(&method) {
            match self.resolve(&req) {
                Ok(caller) => {
                    tracing::Span::current().record("subject_id", caller.subject_id.as_str());
                    context_mut(&mut req).caller = Some(caller);
                }
                Err(err) => {
                    let response = status_response(Status::from(err));
                    return Box::pin(async move { Ok(response) });
                }
            }
        }

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(req).await })
    }
}
