//! Unified error handling for the redgate proxy.
//!
//! A single crate-level error enum covers protocol, transport, routing and
//! configuration failures. RESP error replies from a backend (`-<msg>`) are
//! carried verbatim in [`ProxyError::Resp`] so they can be forwarded to the
//! client byte-for-byte.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for redgate operations.
///
/// The `Io` variant wraps the source error in an `Arc` so that errors can be
/// cloned, which response close memoization relies on.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// Network-level read/write/dial failures.
    #[error("network error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// Malformed RESP from either side of the proxy.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An error reply (`-<msg>`) received from a backend, message verbatim.
    #[error("{0}")]
    Resp(String),

    /// No route could be determined for a request.
    #[error("routing error: {0}")]
    Routing(String),

    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The request's cancellation scope expired or was cancelled.
    #[error("request canceled: {0}")]
    Canceled(String),

    /// Returned by `Server::serve` after a graceful stop. Callers treat this
    /// as success.
    #[error("redgate: server closed")]
    ServerClosed,

    /// Graceful shutdown did not finish before the caller's deadline.
    #[error("shutdown deadline exceeded")]
    ShutdownTimeout,

    /// Any use of a response writer after it was hijacked.
    #[error("invalid use of a hijacked response writer")]
    Hijacked,

    /// The response writer does not support hijacking.
    #[error("the response writer is not hijackable")]
    NotHijackable,

    /// `write_stream` was called with a negative element count.
    #[error("invalid call to write_stream with a negative value")]
    NegativeStreamCount,

    /// `write_stream` was called after `write` within the same reply unit.
    #[error("invalid call to write_stream after write was called")]
    WriteStreamAfterWrite,

    /// `write_stream` was called twice within the same reply unit.
    #[error("multiple calls to write_stream")]
    WriteStreamTwice,

    /// More `write` calls than the declared stream length.
    #[error("too many calls to write")]
    TooManyWrites,

    /// Fewer `write` calls than the declared stream length when the handler
    /// returned.
    #[error("not enough calls to write")]
    NotEnoughWrites,

    /// The response cannot be turned into a retryable request.
    #[error("the request cannot retry")]
    NotRetryable,
}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        ProxyError::Io(Arc::new(err))
    }
}

impl ProxyError {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        ProxyError::Protocol(msg.into())
    }

    pub fn routing<S: Into<String>>(msg: S) -> Self {
        ProxyError::Routing(msg.into())
    }

    /// True for the EOF family of errors that are suppressed from logs: a
    /// client disconnecting is not worth reporting.
    pub fn is_eof(&self) -> bool {
        match self {
            ProxyError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// True if this is an error reply forwarded from a backend rather than a
    /// failure of the proxy itself.
    pub fn is_resp(&self) -> bool {
        matches!(self, ProxyError::Resp(_))
    }
}

/// Configuration-specific errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    /// The upstream URL names a registry scheme redgate does not know.
    #[error("unsupported registry: {0}")]
    UnsupportedRegistry(String),
}

/// Result type alias for redgate operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
