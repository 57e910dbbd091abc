use crate::exception::ServiceError;
use std::time::Duration;
use thiserror::Error;

/// Boxed error type used for transport and codec sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of URL validation failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL is missing required scheme (http/https)
    MissingScheme,
}

/// Uniform error type for every stage of a REST invocation.
///
/// Interface declaration problems, transport failures, unexpected statuses,
/// payload decoding and exception construction all surface through this enum,
/// either as the return value of a blocking call or through an
/// [`AsyncHandle`](crate::AsyncHandle).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RestError {
    /// The declared interface method cannot be turned into a request
    #[error("Malformed interface method '{method}': {reason}")]
    MalformedInterface { method: String, reason: String },

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Single request attempt timed out
    #[error("Request attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Total operation deadline exceeded (including all retries)
    #[error("Operation deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// Transport error (network, connection, proxy tunnel, etc)
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// The server answered with a status the method does not expect.
    ///
    /// Carries the exception built by the registered factory for the
    /// method's declared exception type.
    #[error("{0}")]
    UnexpectedStatus(Box<ServiceError>),

    /// Encoding a request body or decoding a response payload failed
    #[error("Serialization failed for {target}: {source}")]
    Serialization {
        target: String,
        #[source]
        source: BoxError,
    },

    /// The declared exception type could not be instantiated
    #[error("Could not instantiate exception type '{exception}': {source}")]
    ExceptionConstruction {
        exception: String,
        #[source]
        source: BoxError,
    },

    /// Service overloaded (request buffer full, fail-fast)
    #[error("Service overloaded: request buffer full")]
    Overloaded,

    /// Internal service failure (buffer worker died, channel closed)
    #[error("Service unavailable: internal failure")]
    ServiceClosed,

    /// Invalid URL (failed to parse)
    ///
    /// Use the `kind` field for programmatic matching. The `reason` field is
    /// a diagnostic message for logging only.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        url: String,
        kind: InvalidUriKind,
        reason: String,
    },

    /// Invalid URL scheme for transport security configuration
    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme { scheme: String, reason: String },

    /// The asynchronous call was cancelled before it produced a result
    #[error("Call was cancelled")]
    Cancelled,

    /// A materialized output was read as a different type than it holds
    #[error("Output type mismatch: expected {expected}, got {actual}")]
    OutputMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// A long-running operation did not reach a terminal state
    #[error("Long-running operation still in progress after {polls} polls")]
    PollingExhausted { polls: usize },

    /// No usable tokio runtime was available to drive the call
    #[error("Async runtime unavailable: {0}")]
    Runtime(String),
}

impl RestError {
    /// Shorthand for [`RestError::MalformedInterface`].
    pub(crate) fn malformed(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedInterface {
            method: method.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn serialization(target: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Serialization {
            target: target.into(),
            source: source.into(),
        }
    }

    /// Returns the typed service error when the server answered with an
    /// unexpected status.
    #[must_use]
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::UnexpectedStatus(err) => Some(err),
            _ => None,
        }
    }

    /// Returns the HTTP status carried by this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<http::StatusCode> {
        self.service_error().map(ServiceError::status)
    }
}

impl From<ServiceError> for RestError {
    fn from(err: ServiceError) -> Self {
        Self::UnexpectedStatus(Box::new(err))
    }
}

impl From<tokio::runtime::TryCurrentError> for RestError {
    fn from(err: tokio::runtime::TryCurrentError) -> Self {
        Self::Runtime(err.to_string())
    }
}

impl From<hyper::Error> for RestError {
    fn from(err: hyper::Error) -> Self {
        RestError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for RestError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        RestError::Transport(Box::new(err))
    }
}
