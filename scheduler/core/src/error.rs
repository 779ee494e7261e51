//! Error Types
//!
//! Two families of errors live here:
//!
//! - [`RequestError`]: what a request's failure continuation receives. Its
//!   [`ErrorKind`] decides which [`QueryStatus`] the request ends in.
//! - [`SchedulerError`]: problems found while starting the scheduler. These are
//!   programming or deployment errors and are returned to the caller of
//!   [`QueryScheduler::start`](crate::QueryScheduler::start).

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::TransportError;
use crate::request::QueryStatus;

// =============================================================================
// Request Errors
// =============================================================================

/// Classification of request failures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Request text is empty or fails the allow-list check
    Validation,
    /// The requested backend has no provisioned connections
    Configuration,
    /// The engine did not answer before the request's deadline
    DeadlineExceeded,
    /// Any other RPC-layer failure
    Transport,
    /// The caller cancelled the request while it was running
    CancelledByCaller,
    /// The engine answered without any expected result populated
    UnrecognizedResponse,
}

impl ErrorKind {
    /// The user-visible status a request failing with this kind ends in
    #[must_use]
    pub fn status(self) -> QueryStatus {
        match self {
            Self::Validation => QueryStatus::SyntaxError,
            Self::CancelledByCaller => QueryStatus::Unknown,
            Self::Configuration
            | Self::DeadlineExceeded
            | Self::Transport
            | Self::UnrecognizedResponse => QueryStatus::Error,
        }
    }

    /// Whether this kind is a cooperative cancellation rather than a failure
    #[must_use]
    pub fn is_cancellation(self) -> bool {
        matches!(self, Self::CancelledByCaller)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation error"),
            Self::Configuration => write!(f, "configuration error"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Transport => write!(f, "transport error"),
            Self::CancelledByCaller => write!(f, "cancelled"),
            Self::UnrecognizedResponse => write!(f, "unrecognized response"),
        }
    }
}

/// Error delivered to a request's failure continuation
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RequestError {
    kind: ErrorKind,
    message: String,
}

impl RequestError {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Request text failed validation
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Backend is missing or has no connections
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// The engine did not answer in time
    #[must_use]
    pub fn deadline_exceeded() -> Self {
        Self::new(
            ErrorKind::DeadlineExceeded,
            "The backend did not answer the request in time",
        )
    }

    /// Generic RPC failure carrying the transport's message
    pub fn transport(detail: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::Transport,
            format!("The execution of this query failed with message:\n{detail}"),
        )
    }

    /// Cooperative cancellation by the caller
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::CancelledByCaller, "The request was cancelled")
    }

    /// The engine replied without a recognizable result
    #[must_use]
    pub fn unrecognized_response() -> Self {
        Self::new(
            ErrorKind::UnrecognizedResponse,
            "The backend returned no recognizable result",
        )
    }

    /// Error kind
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The user-visible status this error resolves to
    #[must_use]
    pub fn status(&self) -> QueryStatus {
        self.kind.status()
    }
}

// =============================================================================
// Startup Errors
// =============================================================================

/// Errors raised while starting the scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The configuration cannot be used to start a scheduler
    #[error("Invalid scheduler configuration: {0}")]
    Configuration(String),

    /// A connection to an engine could not be opened
    #[error("Failed to open connection {index} to backend '{backend}': {source}")]
    Connect {
        /// Backend name
        backend: String,
        /// Index of the connection within the backend's pool
        index: usize,
        /// Underlying transport failure
        source: TransportError,
    },

    /// The scheduler was started outside a tokio runtime
    #[error("No tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_to_status() {
        assert_eq!(ErrorKind::Validation.status(), QueryStatus::SyntaxError);
        assert_eq!(ErrorKind::CancelledByCaller.status(), QueryStatus::Unknown);
        assert_eq!(ErrorKind::DeadlineExceeded.status(), QueryStatus::Error);
        assert_eq!(ErrorKind::Transport.status(), QueryStatus::Error);
        assert_eq!(ErrorKind::Configuration.status(), QueryStatus::Error);
        assert_eq!(ErrorKind::UnrecognizedResponse.status(), QueryStatus::Error);
    }

    #[test]
    fn test_transport_message_keeps_detail() {
        let err = RequestError::transport("UNAVAILABLE: connection reset");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.message().ends_with("UNAVAILABLE: connection reset"));
        assert!(err.to_string().starts_with("transport error: "));
    }

    #[test]
    fn test_only_cancellation_is_neutral() {
        assert!(RequestError::cancelled().kind().is_cancellation());
        assert!(!RequestError::deadline_exceeded().kind().is_cancellation());
    }
}
