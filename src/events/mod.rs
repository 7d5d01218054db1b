//! Typed agent events.
//!
//! Both wire dialects decode into the same [`Event`] enum:
//!
//! - `adapter`: Dialect B notifications (`method` + `params`).
//! - `stream`: Dialect A event-stream lines (`type` discriminator).
//!
//! Methods outside the core set become [`Event::Unknown`] carrying the raw
//! method and parameters, so nothing the agent sends is ever dropped.

pub mod adapter;
pub(crate) mod fields;
pub mod stream;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use adapter::to_event;
pub use stream::decode_stream_line;

/// Token accounting reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Prompt tokens served from cache.
    #[serde(default)]
    pub cached_input_tokens: u64,
    /// Completion tokens.
    #[serde(default)]
    pub output_tokens: u64,
    /// Completion tokens spent on reasoning.
    #[serde(default)]
    pub reasoning_output_tokens: u64,
    /// Total as reported; absent when the agent does not send one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// One unit of turn progress (message, command run, file change, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Item id, stable across started/updated/completed.
    pub id: String,
    /// Item type as sent by the agent (`agentMessage`, `command_execution`, …).
    pub kind: String,
    /// Text content, for message-like items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// The full item object as received.
    #[serde(default)]
    pub raw: Value,
}

/// Typed event produced by either dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A thread was created or resumed.
    ThreadStarted {
        /// Thread id (opaque resumption token).
        thread_id: String,
    },
    /// A turn began.
    TurnStarted {
        /// Owning thread, when known.
        thread_id: Option<String>,
        /// Turn id, when known.
        turn_id: Option<String>,
    },
    /// A turn finished. Terminal.
    TurnCompleted {
        /// Owning thread, when known.
        thread_id: Option<String>,
        /// Turn id, when known.
        turn_id: Option<String>,
        /// Final status (`completed`, `interrupted`, `failed`).
        status: Option<String>,
        /// Usage for the turn.
        usage: Option<TokenUsage>,
    },
    /// A turn failed. Terminal.
    TurnFailed {
        /// Owning thread, when known.
        thread_id: Option<String>,
        /// Turn id, when known.
        turn_id: Option<String>,
        /// Failure description.
        message: String,
    },
    /// An item began.
    ItemStarted {
        /// Owning thread, when known.
        thread_id: Option<String>,
        /// Owning turn, when known.
        turn_id: Option<String>,
        /// The item.
        item: Item,
    },
    /// An item changed.
    ItemUpdated {
        /// Owning thread, when known.
        thread_id: Option<String>,
        /// Owning turn, when known.
        turn_id: Option<String>,
        /// The item.
        item: Item,
    },
    /// An item finished.
    ItemCompleted {
        /// Owning thread, when known.
        thread_id: Option<String>,
        /// Owning turn, when known.
        turn_id: Option<String>,
        /// The item.
        item: Item,
    },
    /// Streaming fragment of an agent message.
    AgentMessageDelta {
        /// Owning thread, when known.
        thread_id: Option<String>,
        /// Owning turn, when known.
        turn_id: Option<String>,
        /// Item receiving the fragment.
        item_id: String,
        /// Text fragment.
        delta: String,
    },
    /// Aggregated diff for the turn so far.
    TurnDiffUpdated {
        /// Owning thread, when known.
        thread_id: Option<String>,
        /// Owning turn, when known.
        turn_id: Option<String>,
        /// One unified-diff string.
        diff: String,
    },
    /// Token usage changed.
    TokenUsageUpdated {
        /// Owning thread, when known.
        thread_id: Option<String>,
        /// Owning turn, when known.
        turn_id: Option<String>,
        /// Latest usage figures.
        usage: TokenUsage,
    },
    /// Rate-limit snapshot from the provider.
    RateLimitsUpdated {
        /// Snapshot as sent.
        snapshot: Value,
    },
    /// Non-terminal error reported by the agent.
    Error {
        /// Owning thread, when known.
        thread_id: Option<String>,
        /// Owning turn, when known.
        turn_id: Option<String>,
        /// Error message.
        message: String,
        /// The agent will retry on its own.
        will_retry: bool,
    },
    /// Method outside the core set, passed through unchanged.
    Unknown {
        /// Method or `type` discriminator.
        method: String,
        /// Parameters as received.
        params: Value,
    },
    /// A line that could not be decoded. Processing continues.
    DecodeError {
        /// Raw text.
        raw: String,
        /// Failure description.
        error: String,
    },
}

impl Event {
    /// Thread id carried by the event, if any.
    #[must_use]
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            Self::ThreadStarted { thread_id } => Some(thread_id),
            Self::TurnStarted { thread_id, .. }
            | Self::TurnCompleted { thread_id, .. }
            | Self::TurnFailed { thread_id, .. }
            | Self::ItemStarted { thread_id, .. }
            | Self::ItemUpdated { thread_id, .. }
            | Self::ItemCompleted { thread_id, .. }
            | Self::AgentMessageDelta { thread_id, .. }
            | Self::TurnDiffUpdated { thread_id, .. }
            | Self::TokenUsageUpdated { thread_id, .. }
            | Self::Error { thread_id, .. } => thread_id.as_deref(),
            Self::RateLimitsUpdated { .. } | Self::Unknown { .. } | Self::DecodeError { .. } => {
                None
            }
        }
    }

    /// Turn id carried by the event, if any.
    #[must_use]
    pub fn turn_id(&self) -> Option<&str> {
        match self {
            Self::TurnStarted { turn_id, .. }
            | Self::TurnCompleted { turn_id, .. }
            | Self::TurnFailed { turn_id, .. }
            | Self::ItemStarted { turn_id, .. }
            | Self::ItemUpdated { turn_id, .. }
            | Self::ItemCompleted { turn_id, .. }
            | Self::AgentMessageDelta { turn_id, .. }
            | Self::TurnDiffUpdated { turn_id, .. }
            | Self::TokenUsageUpdated { turn_id, .. }
            | Self::Error { turn_id, .. } => turn_id.as_deref(),
            _ => None,
        }
    }

    /// `true` for events that end a turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnCompleted { .. } | Self::TurnFailed { .. })
    }

    /// `true` when the event belongs to `thread_id` / `turn_id`.
    ///
    /// Missing ids on either side match; only a conflicting id excludes.
    #[must_use]
    pub fn matches(&self, thread_id: Option<&str>, turn_id: Option<&str>) -> bool {
        let same = |ours: Option<&str>, theirs: Option<&str>| match (ours, theirs) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        same(thread_id, self.thread_id()) && same(turn_id, self.turn_id())
    }
}
