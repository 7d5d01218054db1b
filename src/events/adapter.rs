//! Dialect B notification adapter.
//!
//! # Core methods
//!
//! | Method                          | Event                          |
//! |---------------------------------|--------------------------------|
//! | `thread/started`                | [`Event::ThreadStarted`]       |
//! | `turn/started`                  | [`Event::TurnStarted`]         |
//! | `turn/completed`                | [`Event::TurnCompleted`]       |
//! | `turn/failed`                   | [`Event::TurnFailed`]          |
//! | `item/started`                  | [`Event::ItemStarted`]         |
//! | `item/updated`                  | [`Event::ItemUpdated`]         |
//! | `item/completed`                | [`Event::ItemCompleted`]       |
//! | `item/agentMessage/delta`       | [`Event::AgentMessageDelta`]   |
//! | `turn/diff/updated`             | [`Event::TurnDiffUpdated`]     |
//! | `thread/tokenUsage/updated`     | [`Event::TokenUsageUpdated`]   |
//! | `account/rateLimits/updated`    | [`Event::RateLimitsUpdated`]   |
//! | `error`                         | [`Event::Error`]               |
//! | *(any other)*                   | [`Event::Unknown`]             |
//!
//! A core method whose payload has the wrong shape also becomes
//! [`Event::Unknown`], logged at `WARN`.

use serde_json::Value;
use tracing::warn;

use crate::events::fields::{field, item, str_field, thread_id, token_usage, turn_id, unified_diff};
use crate::events::Event;

/// Convert one notification into a typed event. Never fails.
#[must_use]
pub fn to_event(method: &str, params: &Value) -> Event {
    let typed = match method {
        "thread/started" => thread_started(params),
        "turn/started" => Some(Event::TurnStarted {
            thread_id: thread_id(params),
            turn_id: turn_id(params),
        }),
        "turn/completed" => Some(turn_completed(params)),
        "turn/failed" => Some(Event::TurnFailed {
            thread_id: thread_id(params),
            turn_id: turn_id(params),
            message: error_message(params).unwrap_or_else(|| "turn failed".to_owned()),
        }),
        "item/started" | "item/updated" | "item/completed" => item_event(method, params),
        "item/agentMessage/delta" => agent_message_delta(params),
        "turn/diff/updated" => diff_updated(params),
        "thread/tokenUsage/updated" => token_usage_updated(params),
        "account/rateLimits/updated" => field(params, "rateLimits", "rate_limits")
            .or(Some(params))
            .filter(|v| v.is_object())
            .map(|snapshot| Event::RateLimitsUpdated {
                snapshot: snapshot.clone(),
            }),
        "error" => error_event(params),
        _ => {
            return Event::Unknown {
                method: method.to_owned(),
                params: params.clone(),
            }
        }
    };

    typed.unwrap_or_else(|| {
        warn!(method, "notification payload has unexpected shape; passing through");
        Event::Unknown {
            method: method.to_owned(),
            params: params.clone(),
        }
    })
}

fn thread_started(params: &Value) -> Option<Event> {
    Some(Event::ThreadStarted {
        thread_id: thread_id(params)?,
    })
}

fn turn_completed(params: &Value) -> Event {
    let turn = params.get("turn");
    let status = turn
        .and_then(|t| str_field(t, "status", "status"))
        .or_else(|| str_field(params, "status", "status"));
    let usage = field(params, "usage", "usage")
        .or_else(|| field(params, "tokenUsage", "token_usage"))
        .and_then(usage_from);

    if status.as_deref() == Some("failed") {
        let message = turn
            .and_then(error_message)
            .or_else(|| error_message(params))
            .unwrap_or_else(|| "turn failed".to_owned());
        return Event::TurnFailed {
            thread_id: thread_id(params),
            turn_id: turn_id(params),
            message,
        };
    }

    Event::TurnCompleted {
        thread_id: thread_id(params),
        turn_id: turn_id(params),
        status,
        usage,
    }
}

fn item_event(method: &str, params: &Value) -> Option<Event> {
    let item = item(params.get("item")?)?;
    let thread_id = thread_id(params);
    let turn_id = turn_id(params);
    Some(match method {
        "item/started" => Event::ItemStarted {
            thread_id,
            turn_id,
            item,
        },
        "item/updated" => Event::ItemUpdated {
            thread_id,
            turn_id,
            item,
        },
        _ => Event::ItemCompleted {
            thread_id,
            turn_id,
            item,
        },
    })
}

fn agent_message_delta(params: &Value) -> Option<Event> {
    Some(Event::AgentMessageDelta {
        thread_id: thread_id(params),
        turn_id: turn_id(params),
        item_id: str_field(params, "itemId", "item_id")?,
        delta: str_field(params, "delta", "delta")?,
    })
}

fn diff_updated(params: &Value) -> Option<Event> {
    let raw = field(params, "diff", "diff")
        .or_else(|| field(params, "unifiedDiff", "unified_diff"))
        .or_else(|| field(params, "changes", "changes"))?;
    Some(Event::TurnDiffUpdated {
        thread_id: thread_id(params),
        turn_id: turn_id(params),
        diff: unified_diff(raw)?,
    })
}

fn token_usage_updated(params: &Value) -> Option<Event> {
    let raw = field(params, "tokenUsage", "token_usage").or_else(|| params.get("usage"))?;
    Some(Event::TokenUsageUpdated {
        thread_id: thread_id(params),
        turn_id: turn_id(params),
        usage: usage_from(raw)?,
    })
}

/// Usage may be flat or split into `total` / `last` breakdowns; `total` wins.
fn usage_from(raw: &Value) -> Option<crate::events::TokenUsage> {
    let breakdown = field(raw, "total", "total").or_else(|| field(raw, "last", "last"));
    token_usage(breakdown.unwrap_or(raw))
}

fn error_event(params: &Value) -> Option<Event> {
    Some(Event::Error {
        thread_id: thread_id(params),
        turn_id: turn_id(params),
        message: error_message(params)?,
        will_retry: field(params, "willRetry", "will_retry")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

/// `error.message`, `error` as a string, or top-level `message`.
pub(crate) fn error_message(params: &Value) -> Option<String> {
    match params.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(err @ Value::Object(_)) => str_field(err, "message", "message"),
        _ => str_field(params, "message", "message"),
    }
}
