//! Structured audit logging for approval negotiation.
//!
//! Provides the [`AuditLogger`] trait and associated types. Every approval
//! state transition produces one [`AuditEntry`]. [`JsonlAuditWriter`]
//! appends entries to per-thread daily files; [`TracingAuditLogger`] emits
//! them as `tracing` events when no log directory is configured.

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Event type classification for audit log entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// The agent asked for approval.
    ApprovalSubmitted,
    /// The decision was deferred to a hook or an out-of-band reply.
    ApprovalDeferred,
    /// The request was approved.
    ApprovalApproved,
    /// The request was declined or the turn aborted.
    ApprovalDenied,
    /// No decision arrived in time; denied.
    ApprovalTimedOut,
}

impl AuditEventType {
    /// Whether this entry records the request's final disposition.
    #[must_use]
    pub fn is_disposition(&self) -> bool {
        matches!(
            self,
            Self::ApprovalApproved | Self::ApprovalDenied | Self::ApprovalTimedOut
        )
    }
}

/// A structured record of one approval transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// ISO 8601 timestamp with timezone.
    pub timestamp: DateTime<Utc>,
    /// Event classification.
    pub event_type: AuditEventType,
    /// Server request id.
    pub request_id: Option<String>,
    /// Server request method.
    pub method: Option<String>,
    /// Owning thread.
    pub thread_id: Option<String>,
    /// Owning turn.
    pub turn_id: Option<String>,
    /// Command awaiting approval (command approvals only).
    pub command: Option<String>,
    /// Wire name of the decision.
    pub decision: Option<String>,
    /// Denial or timeout reason.
    pub reason: Option<String>,
}

impl AuditEntry {
    /// Construct a minimal audit entry for the given event type.
    #[must_use]
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            request_id: None,
            method: None,
            thread_id: None,
            turn_id: None,
            command: None,
            decision: None,
            reason: None,
        }
    }

    /// Set the server request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: String) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Set the server request method.
    #[must_use]
    pub fn with_method(mut self, method: String) -> Self {
        self.method = Some(method);
        self
    }

    /// Set thread and turn ids.
    #[must_use]
    pub fn with_turn(mut self, thread_id: Option<String>, turn_id: Option<String>) -> Self {
        self.thread_id = thread_id;
        self.turn_id = turn_id;
        self
    }

    /// Set the command.
    #[must_use]
    pub fn with_command(mut self, command: Option<String>) -> Self {
        self.command = command;
        self
    }

    /// Set the decision name.
    #[must_use]
    pub fn with_decision(mut self, decision: String) -> Self {
        self.decision = Some(decision);
        self
    }

    /// Set the denial or timeout reason.
    #[must_use]
    pub fn with_reason(mut self, reason: String) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Writes structured audit entries to a persistent store.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait AuditLogger: Send + Sync {
    /// Record a single audit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn log_entry(&self, entry: AuditEntry) -> crate::Result<()>;
}

/// Emits audit entries as `INFO` tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log_entry(&self, entry: AuditEntry) -> crate::Result<()> {
        info!(
            event_type = ?entry.event_type,
            request_id = entry.request_id.as_deref().unwrap_or_default(),
            method = entry.method.as_deref().unwrap_or_default(),
            decision = entry.decision.as_deref().unwrap_or_default(),
            reason = entry.reason.as_deref().unwrap_or_default(),
            "approval audit"
        );
        Ok(())
    }
}

pub use writer::JsonlAuditWriter;
