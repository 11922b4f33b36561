//! Error types for callguard.

use tonic::{Code, Status};

/// Main error type shared by the pipeline, the session subsystem, and the handlers.
///
/// Every variant maps onto exactly one gRPC status code; see the `From<Error>`
/// implementation for [`Status`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing, malformed, or expired credential.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Valid identity without the role required for the operation.
    #[error("permission denied: {0}")]
    Authorization(String),

    /// Malformed request.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The requested entity does not exist (or has expired).
    #[error("not found: {0}")]
    NotFound(String),

    /// The entity being created already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Admission control rejected the call.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// The call's deadline elapsed before the operation finished.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Server construction failed (bind, registry, configuration).
    #[error("startup failed: {0}")]
    Startup(String),

    /// A backing store failed.
    #[error("store error: {0}")]
    Store(String),

    /// Unexpected fault, including contained panics.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// gRPC status code this error surfaces as.
    pub fn code(&self) -> Code {
        match self {
            Error::Authentication(_) => Code::Unauthenticated,
            Error::Authorization(_) => Code::PermissionDenied,
            Error::Validation(_) => Code::InvalidArgument,
            Error::NotFound(_) => Code::NotFound,
            Error::AlreadyExists(_) => Code::AlreadyExists,
            Error::RateLimitExceeded => Code::ResourceExhausted,
            Error::DeadlineExceeded => Code::DeadlineExceeded,
            Error::Startup(_) | Error::Store(_) | Error::Internal(_) => Code::Internal,
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let code = err.code();
        match err {
            Error::Startup(detail) | Error::Store(detail) | Error::Internal(detail) => {
                tracing::error!(%detail, "internal failure surfaced to caller as generic error");
                Status::new(code, "internal error")
            }
            Error::Authentication(msg)
            | Error::Authorization(msg)
            | Error::Validation(msg)
            | Error::NotFound(msg)
            | Error::AlreadyExists(msg) => Status::new(code, msg),
            Error::RateLimitExceeded => Status::new(code, "rate limit exceeded"),
            Error::DeadlineExceeded => Status::new(code, "deadline exceeded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_onto_grpc_codes() {
        let cases = [
            (Error::Authentication("x".into()), Code::Unauthenticated),
            (Error::Authorization("x".into()), Code::PermissionDenied),
            (Error::Validation("x".into()), Code::InvalidArgument),
            (Error::NotFound("x".into()), Code::NotFound),
            (Error::RateLimitExceeded, Code::ResourceExhausted),
            (Error::Internal("x".into()), Code::Internal),
            (Error::AlreadyExists("x".into()), Code::AlreadyExists),
            (Error::DeadlineExceeded, Code::DeadlineExceeded),
        ];

        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn internal_details_are_not_sent_to_caller() {
        let status = Status::from(Error::Store("connection to 10.0.0.7 refused".into()));
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "internal error");

        let status = Status::from(Error::Internal("secret=hunter2".into()));
        assert!(!status.message().contains("hunter2"));
    }

    #[test]
    fn client_errors_keep_their_message() {
        let status = Status::from(Error::Authentication("missing credential".into()));
        assert_eq!(status.message(), "missing credential");
    }
}
