//! callguard: a gRPC server whose every call passes one ordered interceptor
//! pipeline (tracing, metrics, logging, authentication, correlation ids, panic
//! recovery, rate limiting) before reaching the handlers.
//!
//! The crate also carries the pieces the pipeline depends on: a bearer credential
//! verifier, a token-bucket limiter, and a session subsystem for human sign-in.

#![warn(missing_docs)]

/// Per-call context.
pub mod context;

/// Error types.
pub mod error;

/// Bearer credentials.
pub mod identity;

/// Admission control.
pub mod limiter;

/// Interceptor layers.
pub mod pipeline;

/// Server assembly and gRPC services.
pub mod server;

/// Sign-in and sessions.
pub mod session;

/// Logging and metrics.
pub mod telemetry;

/// Generated protobuf types and gRPC stubs.
#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("callguard.v1");
}

pub use context::{CallContext, Caller};
pub use error::{Error, Result};
pub use identity::{Claims, TokenIssuer, TokenVerifier};
pub use limiter::{Admission, KeyedRateLimiter, RateLimiter};
pub use pipeline::{Pipeline, PipelineBuilder, RateLimitScope};
pub use server::{Bootstrap, ServerConfig};
pub use session::{MemoryCredentialStore, MemorySessionStore, SessionManager};
pub use telemetry::{CallMetrics, SharedMetrics};
