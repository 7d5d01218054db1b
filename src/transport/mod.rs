//! Agent subprocess transport.
//!
//! One [`ProcessHandle`] owns one live child process. All of its mutable
//! state (subscriber set, batch buffer, shutdown progress) lives inside a
//! dedicated actor task that reads a single inbox. The stdout reader, stderr
//! reader, stdin writer and exit watcher are independent tasks that only
//! post messages into that inbox.
//!
//! Output lines are JSON-decoded by the stdout reader, grouped into bounded
//! batches and broadcast to every subscriber in registration order. A
//! subscriber receives the complete sequence, never a share of it.
//!
//! [`Transport`] wraps a [`ProcessSpec`] and hands out a live handle on
//! demand, starting a fresh process after the previous one terminated.

mod actor;
mod exit;
pub mod handle;
pub mod lazy;
mod reader;
pub mod spawner;
mod writer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

pub use handle::{Lease, ProcessHandle, Subscription};
pub use lazy::Transport;
pub use reader::decode_line;

use crate::wire::line_buffer::DEFAULT_MAX_LINE_BYTES;

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable name or path.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Variables set explicitly on the child.
    pub env: HashMap<String, String>,
    /// Working directory; inherits the caller's when `None`.
    pub cwd: Option<PathBuf>,
    /// Inherit the full parent environment. When `false` only
    /// [`spawner::ALLOWED_ENV_VARS`] and [`Self::env`] reach the child.
    pub inherit_env: bool,
}

impl ProcessSpec {
    /// Spec for `command` with no arguments and an inherited environment.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            inherit_env: true,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable on the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Tunables for one transport instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Maximum bytes per stdout line before a decode error is emitted.
    pub max_line_bytes: usize,
    /// Maximum lines delivered to subscribers in one batch.
    pub batch_max_lines: usize,
    /// Capacity (in batches) of each subscriber channel.
    pub subscriber_capacity: usize,
    /// Lines retained while nobody is subscribed.
    pub max_backlog_lines: usize,
    /// Queued stdin writes before `send` fails fast.
    pub stdin_queue: usize,
    /// Auto-stop after this long with no subscribers and no leases.
    pub idle_grace: Option<Duration>,
    /// Wait after closing stdin before sending a terminate signal.
    pub close_grace: Duration,
    /// Wait after the terminate signal before killing.
    pub term_grace: Duration,
    /// Wait after the kill before force-removing the handle.
    pub kill_grace: Duration,
    /// Upper bound on delivering buffered output after the process exits.
    pub drain_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            batch_max_lines: 64,
            subscriber_capacity: 256,
            max_backlog_lines: 10_000,
            stdin_queue: 1024,
            idle_grace: None,
            close_grace: Duration::from_secs(2),
            term_grace: Duration::from_secs(2),
            kill_grace: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(1),
        }
    }
}

/// How [`ProcessHandle::stop`] escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Close stdin, then terminate, then kill, each step bounded.
    Graceful,
    /// Kill immediately.
    Immediate,
}

/// Lifecycle of a process handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    /// Child running; output flows to subscribers.
    Running,
    /// A stop was requested and escalation is in progress.
    Stopping,
    /// Child exited; buffered output is still being delivered.
    Draining,
    /// Handle finished. Never leaves this state.
    Terminated,
}

/// How the child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Human-readable description.
    pub reason: String,
}

/// Point-in-time view of a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStatus {
    /// Handle identifier (unique per process launch).
    pub handle_id: u64,
    /// OS process id.
    pub pid: Option<u32>,
    /// Current lifecycle state.
    pub state: TransportState,
    /// Registered subscribers.
    pub subscribers: usize,
    /// Outstanding leases.
    pub leases: usize,
    /// Exit details once known.
    pub exit: Option<ExitInfo>,
}

/// One decoded stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    /// A complete, valid JSON value.
    Json(Value),
    /// A line that could not be framed or parsed.
    Invalid {
        /// Raw text (empty when the line was discarded for size).
        raw: String,
        /// Decode failure description.
        error: String,
    },
}

/// Item delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Ordered batch of stdout lines.
    Lines(Arc<[InboundLine]>),
    /// One stderr line.
    Stderr(String),
    /// The handle terminated; no further items follow.
    Closed {
        /// Why the handle closed.
        reason: String,
        /// Exit details, if the process was observed exiting.
        exit: Option<ExitInfo>,
    },
}

/// Identifier of one subscription on one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub(crate) u64);
