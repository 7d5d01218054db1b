//! Approval negotiation for agent-initiated requests.
//!
//! The agent asks permission before running a command or applying a file
//! change. Each [`ApprovalRequest`] moves through
//! `Pending → SyncResolved` or `Pending → AsyncAwaiting → AsyncResolved |
//! TimedOut`, and exactly one wire reply is written for it.
//!
//! - `policy`: the [`policy::ApprovalHook`] seam and the built-in rule policy.
//! - `negotiator`: drives one request to its disposition.
//! - `wire`: decision encoding per protocol revision.

pub mod negotiator;
pub mod policy;
pub mod wire;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use negotiator::ApprovalNegotiator;
pub use policy::{ApprovalHook, HookFuture, PolicyAction, RulePolicy};

use crate::events::fields::{field, str_field, thread_id, turn_id};
use crate::rpc::{methods, ServerRequest};
use crate::wire::message::RequestId;
use crate::{AppError, Result};

/// What the agent wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// Run a shell command.
    Command,
    /// Apply a file change.
    FileChange,
}

/// One approval-class server request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    /// Server request id; the reply is correlated by it.
    pub id: RequestId,
    /// Method the request arrived on. Determines the reply encoding.
    pub method: String,
    /// Command or file change.
    pub kind: ApprovalKind,
    /// Owning thread, if the agent said.
    pub thread_id: Option<String>,
    /// Owning turn, if the agent said.
    pub turn_id: Option<String>,
    /// Item the request belongs to.
    pub item_id: Option<String>,
    /// Command line (command approvals).
    pub command: Option<String>,
    /// Working directory (command approvals).
    pub cwd: Option<String>,
    /// Paths touched (file change approvals, when listed).
    pub paths: Vec<String>,
    /// Agent-supplied justification.
    pub reason: Option<String>,
    /// Parameters as received.
    pub params: Value,
}

impl ApprovalRequest {
    /// Build from a server request. `None` if the method is not an approval.
    #[must_use]
    pub fn from_server_request(request: &ServerRequest) -> Option<Self> {
        let kind = match request.method.as_str() {
            methods::COMMAND_APPROVAL | methods::LEGACY_EXEC_APPROVAL => ApprovalKind::Command,
            methods::FILE_CHANGE_APPROVAL | methods::LEGACY_PATCH_APPROVAL => {
                ApprovalKind::FileChange
            }
            _ => return None,
        };
        let params = &request.params;
        Some(Self {
            id: request.id.clone(),
            method: request.method.clone(),
            kind,
            thread_id: thread_id(params),
            turn_id: turn_id(params),
            item_id: str_field(params, "itemId", "item_id")
                .or_else(|| str_field(params, "callId", "call_id")),
            command: command_line(params),
            cwd: str_field(params, "cwd", "cwd"),
            paths: changed_paths(params),
            reason: str_field(params, "reason", "reason"),
            params: params.clone(),
        })
    }

    /// Key under which an accept-for-session decision is remembered.
    ///
    /// `None` when the request carries nothing stable to compare, in which
    /// case it is never auto-accepted.
    #[must_use]
    pub fn session_key(&self) -> Option<String> {
        match self.kind {
            ApprovalKind::Command => self.command.as_ref().map(|command| {
                format!("command:{}:{command}", self.cwd.as_deref().unwrap_or_default())
            }),
            ApprovalKind::FileChange if self.paths.is_empty() => None,
            ApprovalKind::FileChange => {
                let mut paths = self.paths.clone();
                paths.sort();
                Some(format!("file_change:{}", paths.join("\n")))
            }
        }
    }

    /// Whether this request belongs to the given turn. Missing ids match.
    #[must_use]
    pub fn matches(&self, thread: &str, turn: Option<&str>) -> bool {
        let thread_ok = self.thread_id.as_deref().is_none_or(|t| t == thread);
        let turn_ok = match (self.turn_id.as_deref(), turn) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => true,
        };
        thread_ok && turn_ok
    }
}

/// Command lines arrive as a string or as an argv array.
fn command_line(params: &Value) -> Option<String> {
    match field(params, "command", "command")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let argv: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
            (!argv.is_empty()).then(|| argv.join(" "))
        }
        _ => None,
    }
}

fn changed_paths(params: &Value) -> Vec<String> {
    match field(params, "fileChanges", "file_changes").or_else(|| params.get("changes")) {
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("path").and_then(Value::as_str))
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

/// A decision on one approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Allow this one request.
    AcceptOnce,
    /// Allow, and auto-accept identical requests for the rest of the session.
    AcceptForSession,
    /// Refuse; the agent continues the turn.
    Decline {
        /// Shown in logs and audit entries.
        reason: Option<String>,
    },
    /// Refuse and stop the turn.
    Abort,
    /// Allow and amend the agent's execution policy.
    AcceptWithAmendment {
        /// Amendment passed through to the agent.
        amendment: Value,
    },
}

impl Decision {
    /// Decline with a reason.
    #[must_use]
    pub fn decline(reason: impl Into<String>) -> Self {
        Self::Decline {
            reason: Some(reason.into()),
        }
    }

    /// Whether the agent may proceed.
    #[must_use]
    pub fn is_accept(&self) -> bool {
        matches!(
            self,
            Self::AcceptOnce | Self::AcceptForSession | Self::AcceptWithAmendment { .. }
        )
    }

    /// Stable name for logs and audit entries.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::AcceptOnce => "accept_once",
            Self::AcceptForSession => "accept_for_session",
            Self::Decline { .. } => "decline",
            Self::Abort => "abort",
            Self::AcceptWithAmendment { .. } => "accept_with_amendment",
        }
    }
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalState {
    /// Received; the hook has not answered yet.
    Pending,
    /// The hook decided immediately.
    SyncResolved,
    /// Waiting for a deferred decision.
    AsyncAwaiting,
    /// A deferred decision arrived.
    AsyncResolved,
    /// No decision in time; denied.
    TimedOut,
}

/// Terminal outcome of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Decided by the hook or by session memory.
    SyncResolved(Decision),
    /// Decided after deferral.
    AsyncResolved(Decision),
    /// Denied because nothing decided in time, or the transport closed.
    TimedOut {
        /// Why.
        reason: String,
    },
}

impl Disposition {
    /// The decision written on the wire.
    #[must_use]
    pub fn decision(&self) -> Decision {
        match self {
            Self::SyncResolved(d) | Self::AsyncResolved(d) => d.clone(),
            Self::TimedOut { reason } => Decision::decline(reason.clone()),
        }
    }

    /// The decision actually made, or [`AppError::ApprovalTimeout`] when
    /// the request was denied for lack of one.
    ///
    /// # Errors
    ///
    /// [`AppError::ApprovalTimeout`] for [`Self::TimedOut`].
    pub fn into_decision(self) -> Result<Decision> {
        match self {
            Self::SyncResolved(d) | Self::AsyncResolved(d) => Ok(d),
            Self::TimedOut { reason } => Err(AppError::ApprovalTimeout(reason)),
        }
    }

    /// Terminal state this disposition represents.
    #[must_use]
    pub fn state(&self) -> ApprovalState {
        match self {
            Self::SyncResolved(_) => ApprovalState::SyncResolved,
            Self::AsyncResolved(_) => ApprovalState::AsyncResolved,
            Self::TimedOut { .. } => ApprovalState::TimedOut,
        }
    }
}

/// Hook verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    /// Decided now.
    Allow(Decision),
    /// Declined now.
    Deny(String),
    /// Decide later; the token identifies the request to the hook.
    Defer(String),
}

/// Turn the request arrived in, as seen by the negotiator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalContext {
    /// Active thread.
    pub thread_id: Option<String>,
    /// Active turn.
    pub turn_id: Option<String>,
}
