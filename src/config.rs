//! Global configuration parsing and validation.
//!
//! Every section except `[agent]` is optional and falls back to defaults.
//! Durations are integers: milliseconds for transport-level timing,
//! seconds for caller-facing deadlines.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::approval::policy::{PolicyAction, RulePolicy};
use crate::retry::{RateLimitOptions, RetryOptions};
use crate::rpc::ConnectionOptions;
use crate::transport::{ProcessSpec, TransportOptions};
use crate::wire::line_buffer::DEFAULT_MAX_LINE_BYTES;
use crate::wire::message::ProtocolRevision;
use crate::{AppError, Result};

/// How to launch the agent.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent executable (e.g., `codex`).
    pub command: String,
    /// Arguments placed before the dialect subcommand.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the agent process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Inherit the parent environment; when `false` only an allowlist passes.
    #[serde(default = "default_true")]
    pub inherit_env: bool,
}

/// Framing, fan-out and shutdown timing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TransportConfig {
    /// Maximum bytes per stdout line.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Maximum lines per fan-out batch.
    #[serde(default = "default_batch_max_lines")]
    pub batch_max_lines: usize,
    /// Per-subscriber channel capacity, in batches.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
    /// Lines retained before the first subscriber registers.
    #[serde(default = "default_max_backlog_lines")]
    pub max_backlog_lines: usize,
    /// Idle auto-stop grace; 0 disables idle auto-stop.
    #[serde(default)]
    pub idle_grace_ms: u64,
    /// Wait after closing stdin.
    #[serde(default = "default_grace_ms")]
    pub close_grace_ms: u64,
    /// Wait after SIGTERM.
    #[serde(default = "default_grace_ms")]
    pub term_grace_ms: u64,
    /// Wait after kill.
    #[serde(default = "default_grace_ms")]
    pub kill_grace_ms: u64,
    /// Bound on delivering buffered output after exit.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            batch_max_lines: default_batch_max_lines(),
            subscriber_capacity: default_subscriber_capacity(),
            max_backlog_lines: default_max_backlog_lines(),
            idle_grace_ms: 0,
            close_grace_ms: default_grace_ms(),
            term_grace_ms: default_grace_ms(),
            kill_grace_ms: default_grace_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// Caller-facing deadlines.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Client request deadline.
    #[serde(default = "default_request_seconds")]
    pub request_seconds: u64,
    /// Turn completion deadline.
    #[serde(default = "default_turn_seconds")]
    pub turn_seconds: u64,
    /// Approval disposition deadline (timeout means deny).
    #[serde(default = "default_approval_seconds")]
    pub approval_seconds: u64,
    /// Deadline for answering other server requests.
    #[serde(default = "default_server_request_seconds")]
    pub server_request_seconds: u64,
    /// Pending-call sweep period.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_seconds: default_request_seconds(),
            turn_seconds: default_turn_seconds(),
            approval_seconds: default_approval_seconds(),
            server_request_seconds: default_server_request_seconds(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Handshake identity and envelope revision.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProtocolConfig {
    /// Envelope fields for the target protocol revision.
    #[serde(flatten)]
    pub revision: ProtocolRevision,
    /// `clientInfo.name` sent in `initialize`.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// `clientInfo.title` sent in `initialize`.
    #[serde(default)]
    pub client_title: Option<String>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            revision: ProtocolRevision::default(),
            client_name: default_client_name(),
            client_title: None,
        }
    }
}

/// Built-in approval policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ApprovalConfig {
    /// Outcome when no rule matches.
    #[serde(default)]
    pub default_action: PolicyAction,
    /// Regex patterns for commands approved without asking.
    #[serde(default)]
    pub auto_approve_commands: Vec<String>,
    /// Glob patterns for file paths whose changes are approved without asking.
    #[serde(default)]
    pub write_patterns: Vec<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_action: PolicyAction::Ask,
            auto_approve_commands: Vec::new(),
            write_patterns: Vec::new(),
        }
    }
}

/// Generic retry settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Cap on the doubling exponent.
    #[serde(default = "default_max_exponent")]
    pub max_exponent: u32,
    /// Randomize delays.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_exponent: default_max_exponent(),
            jitter: true,
        }
    }
}

/// Rate-limit cool-down settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
    /// Wait out rate limits; when `false` they propagate immediately.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cool-down when the provider gives no hint.
    #[serde(default = "default_cooldown_ms")]
    pub default_cooldown_ms: u64,
    /// Upper bound on any single cool-down.
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
    /// Rate-limit waits before giving up.
    #[serde(default = "default_max_rate_limit_waits")]
    pub max_waits: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_cooldown_ms: default_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
            max_waits: default_max_rate_limit_waits(),
        }
    }
}

/// Approval audit log.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AuditConfig {
    /// Root of the per-thread daily JSONL audit files; tracing only when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

fn default_batch_max_lines() -> usize {
    64
}

fn default_subscriber_capacity() -> usize {
    256
}

fn default_max_backlog_lines() -> usize {
    10_000
}

fn default_grace_ms() -> u64 {
    2000
}

fn default_drain_timeout_ms() -> u64 {
    1000
}

fn default_request_seconds() -> u64 {
    60
}

fn default_turn_seconds() -> u64 {
    1800
}

fn default_approval_seconds() -> u64 {
    600
}

fn default_server_request_seconds() -> u64 {
    900
}

fn default_sweep_interval_ms() -> u64 {
    250
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").into()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_exponent() -> u32 {
    10
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_max_cooldown_ms() -> u64 {
    300_000
}

fn default_max_rate_limit_waits() -> u32 {
    3
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Agent launch settings.
    pub agent: AgentConfig,
    /// Transport tuning.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Handshake and envelope settings.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Approval policy.
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// Retry settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Rate-limit settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Audit log settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Process spec for the agent with `extra` arguments appended.
    #[must_use]
    pub fn process_spec<I, S>(&self, extra: I) -> ProcessSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessSpec {
            command: self.agent.command.clone(),
            args: self.agent.args.clone(),
            env: self.agent.env.clone(),
            cwd: self.agent.cwd.clone(),
            inherit_env: self.agent.inherit_env,
        }
        .args(extra)
    }

    /// Transport tuning as runtime options.
    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        let t = &self.transport;
        TransportOptions {
            max_line_bytes: t.max_line_bytes,
            batch_max_lines: t.batch_max_lines,
            subscriber_capacity: t.subscriber_capacity,
            max_backlog_lines: t.max_backlog_lines,
            idle_grace: (t.idle_grace_ms > 0).then(|| Duration::from_millis(t.idle_grace_ms)),
            close_grace: Duration::from_millis(t.close_grace_ms),
            term_grace: Duration::from_millis(t.term_grace_ms),
            kill_grace: Duration::from_millis(t.kill_grace_ms),
            drain_timeout: Duration::from_millis(t.drain_timeout_ms),
            ..TransportOptions::default()
        }
    }

    /// Connection settings as runtime options.
    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            revision: self.protocol.revision.clone(),
            request_timeout: Duration::from_secs(self.timeouts.request_seconds),
            server_request_timeout: Duration::from_secs(self.timeouts.server_request_seconds),
            sweep_interval: Duration::from_millis(self.timeouts.sweep_interval_ms),
            ..ConnectionOptions::default()
        }
    }

    /// Approval deadline.
    #[must_use]
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.approval_seconds)
    }

    /// Turn completion deadline.
    #[must_use]
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.turn_seconds)
    }

    /// Compile the `[approval]` rules.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a pattern does not compile.
    pub fn approval_policy(&self) -> Result<RulePolicy> {
        RulePolicy::new(
            self.approval.default_action,
            &self.approval.auto_approve_commands,
            &self.approval.write_patterns,
        )
    }

    /// Generic retry options.
    #[must_use]
    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            max_exponent: self.retry.max_exponent,
            jitter: self.retry.jitter,
        }
    }

    /// Rate-limit options.
    #[must_use]
    pub fn rate_limit_options(&self) -> RateLimitOptions {
        RateLimitOptions {
            enabled: self.rate_limit.enabled,
            default_cooldown: Duration::from_millis(self.rate_limit.default_cooldown_ms),
            max_cooldown: Duration::from_millis(self.rate_limit.max_cooldown_ms),
            max_waits: self.rate_limit.max_waits,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.agent.command.trim().is_empty() {
            return Err(AppError::Config("agent.command must not be empty".into()));
        }

        let t = &self.transport;
        for (name, value) in [
            ("transport.max_line_bytes", t.max_line_bytes),
            ("transport.batch_max_lines", t.batch_max_lines),
            ("transport.subscriber_capacity", t.subscriber_capacity),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.timeouts.request_seconds == 0 || self.timeouts.turn_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.request_seconds and timeouts.turn_seconds must be greater than zero"
                    .into(),
            ));
        }
        if self.timeouts.sweep_interval_ms == 0 {
            return Err(AppError::Config(
                "timeouts.sweep_interval_ms must be greater than zero".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(AppError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(AppError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.rate_limit.default_cooldown_ms > self.rate_limit.max_cooldown_ms {
            return Err(AppError::Config(
                "rate_limit.default_cooldown_ms must not exceed rate_limit.max_cooldown_ms"
                    .into(),
            ));
        }

        self.approval_policy().map(|_| ())
    }
}
