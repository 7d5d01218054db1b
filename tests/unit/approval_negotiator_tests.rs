//! Unit tests for the approval negotiator.
//!
//! Exercises every disposition path without a live connection by calling
//! `decide` directly: synchronous allow and deny, deferral answered by an
//! out-of-band reply, deferral resolved by the hook, timeout, session
//! memory and failure on transport close.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_conduit::approval::{
    ApprovalContext, ApprovalHook, ApprovalKind, ApprovalNegotiator, ApprovalRequest,
    ApprovalState, Decision, Disposition, HookFuture, HookOutcome, PolicyAction, RulePolicy,
};
use agent_conduit::audit::{AuditEntry, AuditEventType, AuditLogger};
use agent_conduit::wire::message::RequestId;
use serde_json::json;

// ── Helpers ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingAudit {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAudit {
    fn event_types(&self) -> Vec<AuditEventType> {
        self.entries
            .lock()
            .expect("audit lock")
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    fn last(&self) -> AuditEntry {
        self.entries
            .lock()
            .expect("audit lock")
            .last()
            .cloned()
            .expect("at least one entry")
    }
}

impl AuditLogger for RecordingAudit {
    fn log_entry(&self, entry: AuditEntry) -> agent_conduit::Result<()> {
        self.entries.lock().expect("audit lock").push(entry);
        Ok(())
    }
}

/// Hook that defers and then resolves the deferral itself.
struct SelfResolvingHook {
    decision: Option<Decision>,
    delay: Duration,
}

impl ApprovalHook for SelfResolvingHook {
    fn evaluate(
        &self,
        request: ApprovalRequest,
        _context: ApprovalContext,
    ) -> HookFuture<'_, HookOutcome> {
        Box::pin(async move { HookOutcome::Defer(format!("token-{}", request.id)) })
    }

    fn await_decision(
        &self,
        token: String,
        _timeout: Duration,
    ) -> Option<HookFuture<'_, Option<Decision>>> {
        assert!(token.starts_with("token-"));
        let decision = self.decision.clone();
        let delay = self.delay;
        Some(Box::pin(async move {
            tokio::time::sleep(delay).await;
            decision
        }))
    }
}

fn command_request(id: i64, command: &str) -> ApprovalRequest {
    ApprovalRequest {
        id: RequestId::Int(id),
        method: "item/commandExecution/requestApproval".into(),
        kind: ApprovalKind::Command,
        thread_id: Some("thr".into()),
        turn_id: Some("turn".into()),
        item_id: Some(format!("item-{id}")),
        command: Some(command.into()),
        cwd: Some("/work".into()),
        paths: Vec::new(),
        reason: None,
        params: json!({}),
    }
}

fn negotiator(
    action: PolicyAction,
    timeout: Duration,
) -> (ApprovalNegotiator, Arc<RecordingAudit>) {
    let audit = Arc::new(RecordingAudit::default());
    let negotiator = ApprovalNegotiator::with_audit(
        Arc::new(RulePolicy::with_default(action)),
        audit.clone(),
        timeout,
    );
    (negotiator, audit)
}

// ── Synchronous dispositions ──────────────────────────────────────────────────

#[tokio::test]
async fn allow_resolves_synchronously() {
    let (negotiator, audit) = negotiator(PolicyAction::Allow, Duration::from_secs(5));
    let disposition = negotiator
        .decide(command_request(1, "ls"), ApprovalContext::default())
        .await;

    assert_eq!(disposition, Disposition::SyncResolved(Decision::AcceptOnce));
    assert_eq!(disposition.state(), ApprovalState::SyncResolved);
    assert_eq!(
        audit.event_types(),
        vec![
            AuditEventType::ApprovalSubmitted,
            AuditEventType::ApprovalApproved
        ]
    );
    assert!(negotiator.in_flight().is_empty());
}

#[tokio::test]
async fn deny_declines_with_reason() {
    let (negotiator, audit) = negotiator(PolicyAction::Deny, Duration::from_secs(5));
    let disposition = negotiator
        .decide(command_request(2, "rm -rf /"), ApprovalContext::default())
        .await;

    assert!(!disposition.decision().is_accept());
    let last = audit.last();
    assert_eq!(last.event_type, AuditEventType::ApprovalDenied);
    assert_eq!(last.decision.as_deref(), Some("decline"));
    assert_eq!(last.reason.as_deref(), Some("no approval rule matched"));
    assert_eq!(last.command.as_deref(), Some("rm -rf /"));
    assert_eq!(last.request_id.as_deref(), Some("2"));
}

// ── Deferred dispositions ─────────────────────────────────────────────────────

#[tokio::test]
async fn deferred_request_resolved_by_reply() {
    let (negotiator, audit) = negotiator(PolicyAction::Ask, Duration::from_secs(5));
    let mut published = negotiator.subscribe();

    let task = {
        let negotiator = negotiator.clone();
        tokio::spawn(async move {
            negotiator
                .decide(command_request(3, "cargo build"), ApprovalContext::default())
                .await
        })
    };

    let request = tokio::time::timeout(Duration::from_secs(2), published.recv())
        .await
        .expect("published in time")
        .expect("subscriber open");
    assert_eq!(request.id, RequestId::Int(3));
    assert_eq!(
        negotiator.state(&request.id),
        Some(ApprovalState::AsyncAwaiting)
    );

    negotiator
        .reply(&request.id, Decision::AcceptOnce)
        .expect("reply accepted");
    let disposition = task.await.expect("join");

    assert_eq!(disposition, Disposition::AsyncResolved(Decision::AcceptOnce));
    assert_eq!(
        audit.event_types(),
        vec![
            AuditEventType::ApprovalSubmitted,
            AuditEventType::ApprovalDeferred,
            AuditEventType::ApprovalApproved
        ]
    );
    // A second reply finds nothing awaiting.
    assert!(negotiator.reply(&request.id, Decision::Abort).is_err());
}

#[tokio::test]
async fn deferred_request_times_out_as_decline() {
    let (negotiator, audit) = negotiator(PolicyAction::Ask, Duration::from_millis(50));
    let disposition = negotiator
        .decide(command_request(4, "make"), ApprovalContext::default())
        .await;

    assert_eq!(disposition.state(), ApprovalState::TimedOut);
    assert!(matches!(
        disposition.decision(),
        Decision::Decline { reason: Some(ref r) } if r == "approval timed out"
    ));
    let last = audit.last();
    assert_eq!(last.event_type, AuditEventType::ApprovalTimedOut);
    assert_eq!(last.decision.as_deref(), Some("decline"));
}

#[tokio::test]
async fn hook_resolves_its_own_deferral() {
    let hook = SelfResolvingHook {
        decision: Some(Decision::Abort),
        delay: Duration::from_millis(10),
    };
    let negotiator = ApprovalNegotiator::new(Arc::new(hook), Duration::from_secs(2));
    let disposition = negotiator
        .decide(command_request(5, "deploy"), ApprovalContext::default())
        .await;
    assert_eq!(disposition, Disposition::AsyncResolved(Decision::Abort));
}

#[tokio::test]
async fn slow_hook_is_cut_off_by_timeout() {
    let hook = SelfResolvingHook {
        decision: Some(Decision::AcceptOnce),
        delay: Duration::from_secs(5),
    };
    let negotiator = ApprovalNegotiator::new(Arc::new(hook), Duration::from_millis(50));
    let disposition = negotiator
        .decide(command_request(6, "deploy"), ApprovalContext::default())
        .await;
    assert_eq!(disposition.state(), ApprovalState::TimedOut);
}

#[tokio::test]
async fn fail_all_resolves_waiters_as_transport_closed() {
    let (negotiator, _audit) = negotiator(PolicyAction::Ask, Duration::from_secs(5));
    let mut published = negotiator.subscribe();

    let task = {
        let negotiator = negotiator.clone();
        tokio::spawn(async move {
            negotiator
                .decide(command_request(7, "sleep 100"), ApprovalContext::default())
                .await
        })
    };
    published.recv().await.expect("published");

    negotiator.fail_all("agent exited");
    let disposition = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("resolved promptly")
        .expect("join");
    assert_eq!(
        disposition,
        Disposition::TimedOut {
            reason: "transport closed".into()
        }
    );
}

#[tokio::test]
async fn fail_all_cuts_off_hook_resolved_deferral() {
    let hook = SelfResolvingHook {
        decision: Some(Decision::AcceptOnce),
        delay: Duration::from_secs(30),
    };
    let negotiator = ApprovalNegotiator::new(Arc::new(hook), Duration::from_secs(60));

    let task = {
        let negotiator = negotiator.clone();
        tokio::spawn(async move {
            negotiator
                .decide(command_request(77, "deploy"), ApprovalContext::default())
                .await
        })
    };
    let id = RequestId::Int(77);
    while negotiator.state(&id) != Some(ApprovalState::AsyncAwaiting) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    negotiator.fail_all("agent exited");
    let disposition = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("resolved promptly")
        .expect("join");
    assert_eq!(
        disposition,
        Disposition::TimedOut {
            reason: "transport closed".into()
        }
    );
    assert!(negotiator.in_flight().is_empty());
}

#[test]
fn timed_out_disposition_maps_to_approval_timeout() {
    let disposition = Disposition::TimedOut {
        reason: "approval timed out".into(),
    };
    let err = disposition.into_decision().expect_err("no decision");
    assert!(matches!(err, agent_conduit::AppError::ApprovalTimeout(_)));
    assert_eq!(err.to_string(), "approval timeout: approval timed out");

    let accepted = Disposition::AsyncResolved(Decision::AcceptOnce)
        .into_decision()
        .expect("decided");
    assert_eq!(accepted, Decision::AcceptOnce);
}

// ── Session memory ────────────────────────────────────────────────────────────

#[tokio::test]
async fn accept_for_session_covers_identical_requests() {
    let (negotiator, _audit) = negotiator(PolicyAction::Ask, Duration::from_secs(5));
    let mut published = negotiator.subscribe();

    let first = {
        let negotiator = negotiator.clone();
        tokio::spawn(async move {
            negotiator
                .decide(command_request(8, "cargo test"), ApprovalContext::default())
                .await
        })
    };
    let request = published.recv().await.expect("published");
    negotiator
        .reply(&request.id, Decision::AcceptForSession)
        .expect("reply");
    first.await.expect("join");

    let repeat = command_request(9, "cargo test");
    assert!(negotiator.is_session_approved(&repeat));
    let disposition = negotiator
        .decide(repeat, ApprovalContext::default())
        .await;
    assert_eq!(
        disposition,
        Disposition::SyncResolved(Decision::AcceptForSession)
    );

    // Different command still asks.
    assert!(!negotiator.is_session_approved(&command_request(10, "cargo publish")));
}
