//! Error types shared across the crate.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure mode of the transport and
/// protocol layers.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed line or JSON received from the agent.
    Decode(String),
    /// Well-formed message with an unexpected shape.
    Protocol(String),
    /// The agent process exited or its pipes closed.
    TransportClosed(String),
    /// A deadline elapsed before a response or terminal event arrived.
    Timeout(String),
    /// The agent or its provider signalled a rate limit.
    RateLimited {
        /// Human-readable description from the agent.
        message: String,
        /// Provider-suggested cool-down, when one was supplied.
        retry_after: Option<Duration>,
    },
    /// The agent answered a request with a JSON-RPC error object.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },
    /// An approval request was not resolved before its deadline.
    ApprovalTimeout(String),
    /// The caller cancelled the operation.
    Cancelled(String),
    /// The agent process could not be spawned.
    Spawn(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or pipe I/O failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::TransportClosed(msg) => write!(f, "transport closed: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::RateLimited {
                message,
                retry_after: Some(after),
            } => write!(f, "rate limited: {message} (retry after {after:?})"),
            Self::RateLimited { message, .. } => write!(f, "rate limited: {message}"),
            Self::Rpc { code, message, .. } => write!(f, "rpc: {message} (code {code})"),
            Self::ApprovalTimeout(msg) => write!(f, "approval timeout: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

/// Retry classification of an [`AppError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient failure; a fresh attempt may succeed.
    Retryable,
    /// Permanent failure; retrying cannot help.
    Fatal,
    /// Provider back-off signal; wait out the cool-down before retrying.
    RateLimited,
}

impl AppError {
    /// Classify this error for the retry wrapper.
    ///
    /// Rate-limit errors are never reported as [`ErrorClass::Retryable`] so
    /// the wrapper does not apply generic backoff on top of the cool-down.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::TransportClosed(_) | Self::Timeout(_) | Self::Io(_) => ErrorClass::Retryable,
            // -32603 internal error and -32000.. server-defined errors are
            // transient on the agent side; everything else is a caller bug.
            Self::Rpc { code, .. } if *code == -32603 || (-32099..=-32000).contains(code) => {
                ErrorClass::Retryable
            }
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether this error means the underlying process handle is gone.
    #[must_use]
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, Self::TransportClosed(_))
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(format!("malformed json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
