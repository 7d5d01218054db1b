//! Approval hooks and the built-in rule policy.
//!
//! A hook answers each request with a [`HookOutcome`]. Hooks that defer may
//! also resolve the deferral themselves through
//! [`ApprovalHook::await_decision`]; otherwise the negotiator publishes the
//! request and waits for an out-of-band reply.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use regex::RegexSet;
use serde::Deserialize;
use tracing::{info, info_span, warn};

use super::{ApprovalContext, ApprovalKind, ApprovalRequest, Decision, HookOutcome};
use crate::{AppError, Result};

/// Boxed future returned by hook methods.
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Decides approval requests.
pub trait ApprovalHook: Send + Sync {
    /// Evaluate one request.
    fn evaluate(
        &self,
        request: ApprovalRequest,
        context: ApprovalContext,
    ) -> HookFuture<'_, HookOutcome>;

    /// Wait for the decision on a deferred request.
    ///
    /// Returns `None` when the hook cannot resolve deferrals itself. The
    /// future yields `None` if the hook gave up without deciding.
    fn await_decision(
        &self,
        _token: String,
        _timeout: Duration,
    ) -> Option<HookFuture<'_, Option<Decision>>> {
        None
    }
}

/// Fallback when no rule matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    /// Defer to an out-of-band decision.
    #[default]
    Ask,
    /// Decline.
    Deny,
    /// Accept once.
    Allow,
}

/// Rule-based auto-approval.
///
/// Evaluation order:
/// 1. Command requests whose command line matches an allowlist regex.
/// 2. File change requests whose every path matches a write glob.
/// 3. Otherwise the default action.
#[derive(Debug, Clone)]
pub struct RulePolicy {
    default_action: PolicyAction,
    commands: RegexSet,
    command_patterns: Vec<String>,
    write_patterns: Vec<glob::Pattern>,
}

impl RulePolicy {
    /// Compile the rules.
    ///
    /// Invalid individual patterns are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if the regex set as a whole cannot be
    /// built (for example, it exceeds the size limit).
    pub fn new(
        default_action: PolicyAction,
        commands: &[String],
        write_patterns: &[String],
    ) -> Result<Self> {
        let command_patterns: Vec<String> = commands
            .iter()
            .filter(|pattern| match regex::Regex::new(pattern) {
                Ok(_) => true,
                Err(err) => {
                    warn!(pattern = %pattern, %err, "invalid command pattern, skipping");
                    false
                }
            })
            .cloned()
            .collect();
        let commands = RegexSet::new(&command_patterns)
            .map_err(|e| AppError::Config(format!("command allowlist: {e}")))?;

        let write_patterns = write_patterns
            .iter()
            .filter_map(|pattern| match glob::Pattern::new(pattern) {
                Ok(compiled) => Some(compiled),
                Err(err) => {
                    warn!(pattern = %pattern, %err, "invalid glob pattern, skipping");
                    None
                }
            })
            .collect();

        Ok(Self {
            default_action,
            commands,
            command_patterns,
            write_patterns,
        })
    }

    /// Policy with no rules.
    #[must_use]
    pub fn with_default(default_action: PolicyAction) -> Self {
        Self {
            default_action,
            commands: RegexSet::empty(),
            command_patterns: Vec::new(),
            write_patterns: Vec::new(),
        }
    }

    /// Evaluate one request synchronously.
    #[must_use]
    pub fn check(&self, request: &ApprovalRequest) -> HookOutcome {
        let _span = info_span!(
            "policy_evaluate",
            request_id = %request.id,
            kind = ?request.kind,
        )
        .entered();

        if let Some(rule) = self.matched_rule(request) {
            info!(matched_rule = %rule, "auto-approved");
            return HookOutcome::Allow(Decision::AcceptOnce);
        }

        match self.default_action {
            PolicyAction::Allow => HookOutcome::Allow(Decision::AcceptOnce),
            PolicyAction::Deny => HookOutcome::Deny("no approval rule matched".into()),
            PolicyAction::Ask => HookOutcome::Defer(request.id.to_string()),
        }
    }

    fn matched_rule(&self, request: &ApprovalRequest) -> Option<String> {
        match request.kind {
            ApprovalKind::Command => {
                let command = request.command.as_deref()?;
                let index = self.commands.matches(command).into_iter().next()?;
                Some(format!("command:{}", self.command_patterns[index]))
            }
            ApprovalKind::FileChange => {
                if request.paths.is_empty() {
                    return None;
                }
                let mut matched = Vec::with_capacity(request.paths.len());
                for path in &request.paths {
                    let pattern = self.write_patterns.iter().find(|p| p.matches(path))?;
                    matched.push(pattern.as_str());
                }
                matched.dedup();
                Some(format!("file_pattern:write:{}", matched.join(",")))
            }
        }
    }
}

impl ApprovalHook for RulePolicy {
    fn evaluate(
        &self,
        request: ApprovalRequest,
        _context: ApprovalContext,
    ) -> HookFuture<'_, HookOutcome> {
        let outcome = self.check(&request);
        Box::pin(std::future::ready(outcome))
    }
}
