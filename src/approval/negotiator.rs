//! Drives approval requests to a disposition and writes the reply.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::policy::ApprovalHook;
use super::wire::decision_result;
use super::{
    ApprovalContext, ApprovalRequest, ApprovalState, Decision, Disposition, HookOutcome,
};
use crate::audit::{AuditEntry, AuditEventType, AuditLogger, TracingAuditLogger};
use crate::rpc::Connection;
use crate::wire::message::RequestId;
use crate::{AppError, Result};

const PUBLISH_CAPACITY: usize = 64;

struct Active {
    state: ApprovalState,
    reply: Option<oneshot::Sender<Decision>>,
    closed: CancellationToken,
}

struct Inner {
    hook: Arc<dyn ApprovalHook>,
    audit: Arc<dyn AuditLogger>,
    timeout: Duration,
    session: Mutex<HashSet<String>>,
    active: Mutex<HashMap<RequestId, Active>>,
    subscribers: Mutex<Vec<mpsc::Sender<ApprovalRequest>>>,
}

/// Shared approval negotiator.
///
/// Cloning is cheap; clones share session memory and the table of
/// requests awaiting a decision.
#[derive(Clone)]
pub struct ApprovalNegotiator {
    inner: Arc<Inner>,
}

impl fmt::Debug for ApprovalNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalNegotiator")
            .field("timeout", &self.inner.timeout)
            .field("active", &lock(&self.inner.active).len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ApprovalNegotiator {
    /// Create a negotiator. Audit entries go to `tracing`.
    #[must_use]
    pub fn new(hook: Arc<dyn ApprovalHook>, timeout: Duration) -> Self {
        Self::with_audit(hook, Arc::new(TracingAuditLogger), timeout)
    }

    /// Create a negotiator with an explicit audit logger.
    #[must_use]
    pub fn with_audit(
        hook: Arc<dyn ApprovalHook>,
        audit: Arc<dyn AuditLogger>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                hook,
                audit,
                timeout,
                session: Mutex::new(HashSet::new()),
                active: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Deadline for deferred decisions.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Receive requests that wait for [`Self::reply`].
    ///
    /// Requests published while the receiver is full are not redelivered;
    /// they time out and are denied.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::Receiver<ApprovalRequest> {
        let (tx, rx) = mpsc::channel(PUBLISH_CAPACITY);
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    /// Decide a request that is waiting for an out-of-band reply.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] if no request with this id is awaiting a
    /// decision (never published, already decided or timed out).
    pub fn reply(&self, id: &RequestId, decision: Decision) -> Result<()> {
        let sender = lock(&self.inner.active)
            .get_mut(id)
            .and_then(|active| active.reply.take());
        let Some(sender) = sender else {
            return Err(AppError::NotFound(format!(
                "no approval awaiting a reply with id {id}"
            )));
        };
        sender
            .send(decision)
            .map_err(|_| AppError::NotFound(format!("approval {id} already resolved")))
    }

    /// Current state of an in-flight request.
    #[must_use]
    pub fn state(&self, id: &RequestId) -> Option<ApprovalState> {
        lock(&self.inner.active).get(id).map(|active| active.state)
    }

    /// Ids of requests not yet disposed.
    #[must_use]
    pub fn in_flight(&self) -> Vec<RequestId> {
        lock(&self.inner.active).keys().cloned().collect()
    }

    /// Whether an accept-for-session decision covers this request.
    #[must_use]
    pub fn is_session_approved(&self, request: &ApprovalRequest) -> bool {
        request
            .session_key()
            .is_some_and(|key| lock(&self.inner.session).contains(&key))
    }

    /// Fail every request not yet disposed.
    ///
    /// Each resolves as [`Disposition::TimedOut`] ("transport closed"),
    /// whether it waits on the hook or on [`Self::reply`], and is still
    /// answered on the wire if the connection is alive.
    pub fn fail_all(&self, reason: &str) {
        let mut active = lock(&self.inner.active);
        for entry in active.values_mut() {
            entry.reply = None;
            entry.closed.cancel();
        }
        if !active.is_empty() {
            info!(failed = active.len(), reason, "failing active approvals");
        }
    }

    /// Drive `request` to a disposition and write the wire reply.
    ///
    /// Always returns a disposition. A failed reply write is logged; the
    /// connection's own sweep then answers the request.
    pub async fn negotiate(
        &self,
        conn: &Connection,
        request: ApprovalRequest,
        context: ApprovalContext,
    ) -> Disposition {
        let span = approval_span(&request);
        async move {
            let disposition = self.decide(request.clone(), context).await;
            Self::answer(conn, &request, &disposition).await;
            disposition
        }
        .instrument(span)
        .await
    }

    /// Write the wire reply for a decided request.
    pub async fn answer(conn: &Connection, request: &ApprovalRequest, disposition: &Disposition) {
        let reply = decision_result(&request.method, &disposition.decision());
        if let Err(err) = conn.respond(&request.id, reply).await {
            warn!(request_id = %request.id, %err, "approval reply not written");
        }
    }

    /// Drive `request` to a disposition without writing a reply.
    ///
    /// Session memory, audit entries and the in-flight table are updated as
    /// in [`Self::negotiate`].
    pub async fn decide(&self, request: ApprovalRequest, context: ApprovalContext) -> Disposition {
        let disposition = self.evaluate(&request, context).await;
        self.finish(&request, &disposition);
        disposition
    }

    async fn evaluate(&self, request: &ApprovalRequest, context: ApprovalContext) -> Disposition {
        let closed = self.track(&request.id, ApprovalState::Pending);
        self.audit(request, AuditEntry::new(AuditEventType::ApprovalSubmitted));

        if self.is_session_approved(request) {
            debug!("covered by session approval");
            self.track(&request.id, ApprovalState::SyncResolved);
            return Disposition::SyncResolved(Decision::AcceptForSession);
        }

        let outcome = tokio::select! {
            biased;
            () = closed.cancelled() => return transport_closed(),
            outcome = self.inner.hook.evaluate(request.clone(), context) => outcome,
        };
        match outcome {
            HookOutcome::Allow(decision) => {
                self.track(&request.id, ApprovalState::SyncResolved);
                Disposition::SyncResolved(decision)
            }
            HookOutcome::Deny(reason) => {
                self.track(&request.id, ApprovalState::SyncResolved);
                Disposition::SyncResolved(Decision::decline(reason))
            }
            HookOutcome::Defer(token) => self.await_deferred(request, token, &closed).await,
        }
    }

    async fn await_deferred(
        &self,
        request: &ApprovalRequest,
        token: String,
        closed: &CancellationToken,
    ) -> Disposition {
        let timeout = self.inner.timeout;
        self.track(&request.id, ApprovalState::AsyncAwaiting);
        self.audit(request, AuditEntry::new(AuditEventType::ApprovalDeferred));

        let disposition = if let Some(wait) = self.inner.hook.await_decision(token, timeout) {
            tokio::select! {
                biased;
                () = closed.cancelled() => transport_closed(),
                waited = tokio::time::timeout(timeout, wait) => match waited {
                    Ok(Some(decision)) => Disposition::AsyncResolved(decision),
                    Ok(None) => Disposition::TimedOut {
                        reason: "approval hook gave no decision".into(),
                    },
                    Err(_) => timed_out(),
                },
            }
        } else {
            let (tx, rx) = oneshot::channel();
            if let Some(active) = lock(&self.inner.active).get_mut(&request.id) {
                active.reply = Some(tx);
            }
            self.publish(request);
            tokio::select! {
                biased;
                () = closed.cancelled() => transport_closed(),
                waited = tokio::time::timeout(timeout, rx) => match waited {
                    Ok(Ok(decision)) => Disposition::AsyncResolved(decision),
                    Ok(Err(_)) => transport_closed(),
                    Err(_) => timed_out(),
                },
            }
        };

        self.track(&request.id, disposition.state());
        disposition
    }

    fn publish(&self, request: &ApprovalRequest) {
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.retain(|tx| match tx.try_send(request.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(request_id = %request.id, "approval subscriber full");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if subscribers.is_empty() {
            debug!(request_id = %request.id, "no approval subscribers");
        }
    }

    /// Record `state` and return the request's close signal.
    fn track(&self, id: &RequestId, state: ApprovalState) -> CancellationToken {
        let mut active = lock(&self.inner.active);
        let entry = active
            .entry(id.clone())
            .and_modify(|active| active.state = state)
            .or_insert_with(|| Active {
                state,
                reply: None,
                closed: CancellationToken::new(),
            });
        entry.closed.clone()
    }

    fn finish(&self, request: &ApprovalRequest, disposition: &Disposition) {
        lock(&self.inner.active).remove(&request.id);

        let decision = disposition.decision();
        if decision == Decision::AcceptForSession {
            if let Some(key) = request.session_key() {
                lock(&self.inner.session).insert(key);
            }
        }

        let entry = match disposition {
            Disposition::TimedOut { reason } => {
                AuditEntry::new(AuditEventType::ApprovalTimedOut).with_reason(reason.clone())
            }
            _ if decision.is_accept() => AuditEntry::new(AuditEventType::ApprovalApproved),
            _ => {
                let entry = AuditEntry::new(AuditEventType::ApprovalDenied);
                match &decision {
                    Decision::Decline {
                        reason: Some(reason),
                    } => entry.with_reason(reason.clone()),
                    _ => entry,
                }
            }
        };
        self.audit(request, entry.with_decision(decision.label().to_owned()));
    }

    fn audit(&self, request: &ApprovalRequest, entry: AuditEntry) {
        let entry = entry
            .with_request_id(request.id.to_string())
            .with_method(request.method.clone())
            .with_turn(request.thread_id.clone(), request.turn_id.clone())
            .with_command(request.command.clone());
        if let Err(err) = self.inner.audit.log_entry(entry) {
            warn!(%err, "audit write failed");
        }
    }
}

/// Span covering one request's negotiation.
#[must_use]
pub fn approval_span(request: &ApprovalRequest) -> tracing::Span {
    tracing::info_span!(
        "approval",
        request_id = %request.id,
        method = %request.method,
    )
}

fn transport_closed() -> Disposition {
    Disposition::TimedOut {
        reason: "transport closed".into(),
    }
}

fn timed_out() -> Disposition {
    Disposition::TimedOut {
        reason: "approval timed out".into(),
    }
}
