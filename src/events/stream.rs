//! Dialect A event-stream decoding.
//!
//! Each line is one JSON object discriminated by `type` (dotted names such
//! as `thread.started`) or, on some revisions, by `method`. Stream lines
//! carry their fields at the top level rather than under `params`.

use serde_json::Value;

use crate::events::adapter::{error_message, to_event};
use crate::events::fields::{field, item, str_field, thread_id, token_usage, turn_id};
use crate::events::Event;
use crate::transport::InboundLine;

/// Decode one transport line into an event. Never fails.
#[must_use]
pub fn decode_inbound(line: &InboundLine) -> Event {
    match line {
        InboundLine::Json(value) => decode_stream_line(value),
        InboundLine::Invalid { raw, error } => Event::DecodeError {
            raw: raw.clone(),
            error: error.clone(),
        },
    }
}

/// Decode one Dialect A object.
#[must_use]
pub fn decode_stream_line(value: &Value) -> Event {
    if let Some(kind) = value.get("type").and_then(Value::as_str) {
        return decode_typed(kind, value);
    }
    if let Some(method) = value.get("method").and_then(Value::as_str) {
        let params = value.get("params").unwrap_or(&Value::Null);
        return to_event(method, params);
    }
    Event::DecodeError {
        raw: value.to_string(),
        error: "stream line has neither `type` nor `method`".into(),
    }
}

fn decode_typed(kind: &str, value: &Value) -> Event {
    let typed = match kind {
        "thread.started" => thread_id(value).map(|thread_id| Event::ThreadStarted { thread_id }),
        "turn.started" => Some(Event::TurnStarted {
            thread_id: thread_id(value),
            turn_id: turn_id(value),
        }),
        "turn.completed" => Some(Event::TurnCompleted {
            thread_id: thread_id(value),
            turn_id: turn_id(value),
            status: str_field(value, "status", "status"),
            usage: field(value, "usage", "usage").and_then(token_usage),
        }),
        "turn.failed" => Some(Event::TurnFailed {
            thread_id: thread_id(value),
            turn_id: turn_id(value),
            message: error_message(value).unwrap_or_else(|| "turn failed".to_owned()),
        }),
        "item.started" | "item.updated" | "item.completed" => {
            value.get("item").and_then(item).map(|item| {
                let thread_id = thread_id(value);
                let turn_id = turn_id(value);
                match kind {
                    "item.started" => Event::ItemStarted {
                        thread_id,
                        turn_id,
                        item,
                    },
                    "item.updated" => Event::ItemUpdated {
                        thread_id,
                        turn_id,
                        item,
                    },
                    _ => Event::ItemCompleted {
                        thread_id,
                        turn_id,
                        item,
                    },
                }
            })
        }
        "error" => error_message(value).map(|message| Event::Error {
            thread_id: thread_id(value),
            turn_id: turn_id(value),
            message,
            will_retry: false,
        }),
        _ => {
            return Event::Unknown {
                method: kind.to_owned(),
                params: value.clone(),
            }
        }
    };

    typed.unwrap_or_else(|| {
        tracing::warn!(kind, "stream event has unexpected shape; passing through");
        Event::Unknown {
            method: kind.to_owned(),
            params: value.clone(),
        }
    })
}
