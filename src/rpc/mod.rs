//! Dialect B request correlation.
//!
//! A [`Connection`] sits on top of one [`crate::transport::ProcessHandle`].
//! Its actor owns the pending-call table and the connection subscriber
//! list; callers register a call, write the request themselves and await
//! the reply.
//!
//! - `pending`: id allocation and the pending-call table.
//! - `connection`: the actor, server-request tracking and the public API.
//! - `handshake`: `initialize` / `initialized`.
//! - `thread`: thread and turn request helpers.

pub mod connection;
pub mod handshake;
pub mod pending;
pub mod thread;

use std::time::Duration;

use serde_json::Value;

pub use connection::{CallHandle, Connection, ConnectionEvents};

use crate::events::fields::field;
use crate::events::Event;
use crate::wire::message::{ProtocolRevision, RequestId, RpcErrorObject};
use crate::AppError;

/// Method names used on the wire.
pub mod methods {
    /// Command execution approval (current revision).
    pub const COMMAND_APPROVAL: &str = "item/commandExecution/requestApproval";
    /// File change approval (current revision).
    pub const FILE_CHANGE_APPROVAL: &str = "item/fileChange/requestApproval";
    /// Command execution approval (legacy revision).
    pub const LEGACY_EXEC_APPROVAL: &str = "execCommandApproval";
    /// Patch approval (legacy revision).
    pub const LEGACY_PATCH_APPROVAL: &str = "applyPatchApproval";
    /// Tool asking the user a question.
    pub const REQUEST_USER_INPUT: &str = "item/tool/requestUserInput";
    /// Best-effort notice that a client request was abandoned.
    pub const CANCEL_REQUEST: &str = "$/cancelRequest";
    /// Handshake request.
    pub const INITIALIZE: &str = "initialize";
    /// Handshake acknowledgement notification.
    pub const INITIALIZED: &str = "initialized";
    /// Create a thread.
    pub const THREAD_START: &str = "thread/start";
    /// Resume a thread by id.
    pub const THREAD_RESUME: &str = "thread/resume";
    /// Start a turn.
    pub const TURN_START: &str = "turn/start";
    /// Interrupt a running turn.
    pub const TURN_INTERRUPT: &str = "turn/interrupt";

    /// Server requests answered as approvals.
    pub const APPROVALS: &[&str] = &[
        COMMAND_APPROVAL,
        FILE_CHANGE_APPROVAL,
        LEGACY_EXEC_APPROVAL,
        LEGACY_PATCH_APPROVAL,
    ];

    /// Whether `method` is an approval request.
    #[must_use]
    pub fn is_approval(method: &str) -> bool {
        APPROVALS.contains(&method)
    }

    /// Server requests this client knows how to route.
    #[must_use]
    pub fn is_known_server_request(method: &str) -> bool {
        is_approval(method) || method == REQUEST_USER_INPUT
    }
}

/// Connection tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Envelope fields for the target protocol revision.
    pub revision: ProtocolRevision,
    /// Default deadline for client requests.
    pub request_timeout: Duration,
    /// Deadline for answering known server requests before the sweep
    /// replies on the caller's behalf.
    pub server_request_timeout: Duration,
    /// Sweep period.
    pub sweep_interval: Duration,
    /// Capacity of each connection subscriber channel.
    pub event_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            revision: ProtocolRevision::default(),
            request_timeout: Duration::from_secs(60),
            server_request_timeout: Duration::from_secs(900),
            sweep_interval: Duration::from_millis(250),
            event_capacity: 1024,
        }
    }
}

/// A request sent by the agent that this client must answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRequest {
    /// Id chosen by the agent.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Parameters as received.
    pub params: Value,
}

/// Item delivered to connection subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Notification (or undecodable line) as a typed event.
    Event(Event),
    /// Server request awaiting an answer via [`Connection::respond`].
    ServerRequest(ServerRequest),
    /// The connection closed; every pending call has failed.
    Closed {
        /// Why.
        reason: String,
    },
}

/// Map a JSON-RPC error object to a crate error.
///
/// Errors that look like provider rate limits (HTTP-style code 429, a
/// "rate limit" / "usage limit" message, or a rate-limit marker in `data`)
/// become [`AppError::RateLimited`], carrying any retry hint from `data`.
#[must_use]
pub fn rpc_error(err: RpcErrorObject) -> AppError {
    if is_rate_limit(&err) {
        let retry_after = err.data.as_ref().and_then(retry_after);
        return AppError::RateLimited {
            message: err.message,
            retry_after,
        };
    }
    AppError::Rpc {
        code: err.code,
        message: err.message,
        data: err.data,
    }
}

fn is_rate_limit(err: &RpcErrorObject) -> bool {
    if err.code == 429 {
        return true;
    }
    let message = err.message.to_ascii_lowercase();
    if message.contains("rate limit") || message.contains("usage limit") {
        return true;
    }
    err.data
        .as_ref()
        .and_then(|d| field(d, "codexErrorInfo", "codex_error_info"))
        .is_some_and(|info| {
            let text = info.to_string().to_ascii_lowercase();
            text.contains("ratelimit") || text.contains("usagelimit") || text.contains("rate_limit")
        })
}

fn retry_after(data: &Value) -> Option<Duration> {
    if let Some(ms) = field(data, "retryAfterMs", "retry_after_ms").and_then(Value::as_u64) {
        return Some(Duration::from_millis(ms));
    }
    field(data, "retryAfterSeconds", "retry_after_seconds")
        .or_else(|| field(data, "retryAfter", "retry_after"))
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
}
