//! Per-call context threaded through the interceptor pipeline.
//!
//! The context is a single typed value stored in the request extensions. The
//! outermost interceptor creates it, later interceptors fill in the caller and the
//! correlation id, and handlers read it back through [`CallContext::of`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::{Error, Result};

/// Metadata key carrying the caller's correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Metadata key carrying the bearer credential.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Metadata key carrying the client-supplied gRPC timeout.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Upper bound on a call's lifetime when none is configured.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity resolved from a verified bearer credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    /// Subject the credential was issued to.
    pub subject_id: String,
    /// Role claimed by the credential.
    pub role: String,
}

/// Ambient record for one call. Never shared across calls.
#[derive(Clone, Debug)]
pub struct CallContext {
    /// Fully-qualified method name, `<service>/<method>`.
    pub method: String,
    /// Correlation id, assigned by the correlation interceptor.
    pub correlation_id: Option<String>,
    /// Point in time after which the call is abandoned.
    pub deadline: Instant,
    /// Resolved identity; `None` for allow-listed methods.
    pub caller: Option<Caller>,
}

impl CallContext {
    /// Creates a context for `method` that expires `timeout` from now.
    pub fn new(method: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: method.into(),
            correlation_id: None,
            deadline: Instant::now() + timeout,
            caller: None,
        }
    }

    /// Builds the context for an inbound HTTP/2 request.
    ///
    /// The deadline is the client's `grpc-timeout`, clamped to `max_timeout`.
    pub fn from_request<B>(req: &http::Request<B>, max_timeout: Duration) -> Self {
        let timeout = req
            .headers()
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map_or(max_timeout, |t| t.min(max_timeout));

        Self::new(method_name(req.uri().path()), timeout)
    }

    /// Reads the context a pipeline attached to a tonic request.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the request never passed through the pipeline.
    pub fn of<T>(request: &tonic::Request<T>) -> Result<&CallContext> {
        request
            .extensions()
            .get::<CallContext>()
            .ok_or_else(|| Error::Internal("call context missing from request".to_string()))
    }

    /// Returns the resolved caller.
    ///
    /// # Errors
    /// Returns [`Error::Authentication`] if no identity was resolved for this call.
    pub fn caller(&self) -> Result<&Caller> {
        self.caller
            .as_ref()
            .ok_or_else(|| Error::Authentication("missing credential".to_string()))
    }

    /// Returns the caller if it holds `role`.
    ///
    /// # Errors
    /// [`Error::Authentication`] without identity, [`Error::Authorization`] for any
    /// other role.
    pub fn require_role(&self, role: &str) -> Result<&Caller> {
        let caller = self.caller()?;
        if caller.role != role {
            return Err(Error::Authorization(format!(
                "role '{role}' required for {}",
                self.method
            )));
        }
        Ok(caller)
    }

    /// Time left until the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Runs `fut`, abandoning it once the call's deadline passes.
    ///
    /// # Errors
    /// Propagates the future's error, or [`Error::DeadlineExceeded`].
    pub async fn within_deadline<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout_at(self.deadline, fut)
            .await
            .map_err(|_| Error::DeadlineExceeded)?
    }
}

/// Strips the leading slash from an HTTP/2 path, leaving `<service>/<method>`.
pub fn method_name(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

/// Parses a `grpc-timeout` value: at most eight ASCII digits followed by a unit
/// (`H`, `M`, `S`, `m`, `u`, `n`).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 || !value.is_ascii() {
        return None;
    }

    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    let timeout = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };

    Some(timeout)
}

/// Returns the request's context, creating it if no outer interceptor did.
pub(crate) fn context_mut<B>(req: &mut http::Request<B>) -> &mut CallContext {
    if req.extensions().get::<CallContext>().is_none() {
        let ctx = CallContext::from_request(req, DEFAULT_CALL_TIMEOUT);
        req.extensions_mut().insert(ctx);
    }

    req.extensions_mut()
        .get_mut::<CallContext>()
        .unwrap_or_else(|| unreachable!("call context inserted above"))
}
