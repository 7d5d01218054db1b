//! Unit tests for notification and stream-line adaptation.
//!
//! Covers the core method set, unknown passthrough, field-spelling
//! precedence, diff normalization and the serde shape of events.

use agent_conduit::events::{decode_stream_line, to_event, Event, Item, TokenUsage};
use serde_json::{json, Value};

// ── Core methods ──────────────────────────────────────────────────────────────

#[test]
fn thread_and_turn_lifecycle() {
    assert_eq!(
        to_event("thread/started", &json!({"thread": {"id": "thr_1"}})),
        Event::ThreadStarted {
            thread_id: "thr_1".into()
        }
    );
    assert_eq!(
        to_event(
            "turn/started",
            &json!({"threadId": "thr_1", "turn": {"id": "turn_1"}})
        ),
        Event::TurnStarted {
            thread_id: Some("thr_1".into()),
            turn_id: Some("turn_1".into()),
        }
    );
}

#[test]
fn turn_completed_prefers_total_usage() {
    let event = to_event(
        "turn/completed",
        &json!({
            "threadId": "t",
            "turn": {"id": "u", "status": "completed"},
            "usage": {
                "total": {"inputTokens": 10, "outputTokens": 5},
                "last": {"inputTokens": 1, "outputTokens": 1}
            }
        }),
    );
    match event {
        Event::TurnCompleted {
            status, usage: Some(usage), ..
        } => {
            assert_eq!(status.as_deref(), Some("completed"));
            assert_eq!(usage.input_tokens, 10);
            assert_eq!(usage.output_tokens, 5);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn agent_message_delta_requires_item_and_text() {
    let event = to_event(
        "item/agentMessage/delta",
        &json!({"threadId": "t", "turnId": "u", "itemId": "i", "delta": "Hel"}),
    );
    assert!(matches!(event, Event::AgentMessageDelta { ref delta, .. } if delta == "Hel"));

    // Missing delta: known method with a bad shape passes through.
    let event = to_event("item/agentMessage/delta", &json!({"itemId": "i"}));
    assert!(matches!(event, Event::Unknown { ref method, .. } if method == "item/agentMessage/delta"));
}

#[test]
fn error_notification_reads_will_retry() {
    let event = to_event(
        "error",
        &json!({"error": {"message": "stream disconnected"}, "willRetry": true}),
    );
    assert!(matches!(event, Event::Error { will_retry: true, ref message, .. } if message == "stream disconnected"));
}

#[test]
fn unknown_methods_pass_through_losslessly() {
    let params = json!({"anything": [1, 2, {"x": null}]});
    assert_eq!(
        to_event("vendor/custom", &params),
        Event::Unknown {
            method: "vendor/custom".into(),
            params,
        }
    );
}

// ── Field spelling ────────────────────────────────────────────────────────────

#[test]
fn camel_case_wins_when_both_spellings_present() {
    let event = to_event(
        "item/agentMessage/delta",
        &json!({
            "itemId": "camel", "item_id": "snake",
            "delta": "d", "threadId": "T", "thread_id": "t"
        }),
    );
    match event {
        Event::AgentMessageDelta {
            item_id, thread_id, ..
        } => {
            assert_eq!(item_id, "camel");
            assert_eq!(thread_id.as_deref(), Some("T"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn snake_case_accepted_alone() {
    let event = to_event(
        "thread/tokenUsage/updated",
        &json!({"thread_id": "t", "token_usage": {"input_tokens": 3, "output_tokens": 4}}),
    );
    assert!(matches!(
        event,
        Event::TokenUsageUpdated { usage: TokenUsage { input_tokens: 3, output_tokens: 4, .. }, .. }
    ));
}

// ── Diffs ─────────────────────────────────────────────────────────────────────

#[test]
fn diff_string_passes_through() {
    let event = to_event("turn/diff/updated", &json!({"diff": "--- a\n+++ b\n"}));
    assert!(matches!(event, Event::TurnDiffUpdated { ref diff, .. } if diff == "--- a\n+++ b\n"));
}

#[test]
fn structured_diff_becomes_one_string() {
    let event = to_event(
        "turn/diff/updated",
        &json!({"changes": [
            {"unifiedDiff": "--- a/x\n+++ b/x"},
            {"unified_diff": "--- a/y\n+++ b/y\n"}
        ]}),
    );
    match event {
        Event::TurnDiffUpdated { diff, .. } => {
            assert_eq!(diff, "--- a/x\n+++ b/x\n--- a/y\n+++ b/y\n");
        }
        other => panic!("unexpected {other:?}"),
    }
}

// ── Dialect A stream lines ────────────────────────────────────────────────────

#[test]
fn stream_lines_use_dotted_types() {
    assert_eq!(
        decode_stream_line(&json!({"type": "thread.started", "thread_id": "t9"})),
        Event::ThreadStarted {
            thread_id: "t9".into()
        }
    );
    let completed = decode_stream_line(&json!({
        "type": "turn.completed",
        "usage": {"input_tokens": 2, "cached_input_tokens": 1, "output_tokens": 3}
    }));
    assert!(completed.is_terminal());

    let item = decode_stream_line(&json!({
        "type": "item.completed",
        "item": {"id": "item_0", "type": "agent_message", "text": "done"}
    }));
    assert!(matches!(item, Event::ItemCompleted { ref item, .. } if item.text.as_deref() == Some("done")));
}

#[test]
fn stream_line_without_discriminator_is_decode_error() {
    let event = decode_stream_line(&json!({"hello": "world"}));
    assert!(matches!(event, Event::DecodeError { .. }));
}

#[test]
fn stream_line_with_method_uses_adapter() {
    let event = decode_stream_line(&json!({"method": "turn/failed", "params": {"error": "boom"}}));
    assert!(matches!(event, Event::TurnFailed { ref message, .. } if message == "boom"));
}

// ── Serde shape ───────────────────────────────────────────────────────────────

#[test]
fn core_events_survive_serialization() {
    let events = vec![
        Event::TurnCompleted {
            thread_id: Some("t".into()),
            turn_id: Some("u".into()),
            status: Some("completed".into()),
            usage: Some(TokenUsage {
                input_tokens: 1,
                cached_input_tokens: 0,
                output_tokens: 2,
                reasoning_output_tokens: 0,
                total_tokens: Some(3),
            }),
        },
        Event::ItemStarted {
            thread_id: None,
            turn_id: None,
            item: Item {
                id: "i".into(),
                kind: "commandExecution".into(),
                text: None,
                raw: json!({"id": "i", "type": "commandExecution"}),
            },
        },
        Event::RateLimitsUpdated {
            snapshot: json!({"primary": {"usedPercent": 12.5}}),
        },
    ];
    for event in events {
        let encoded: Value = serde_json::to_value(&event).expect("encode");
        let decoded: Event = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded, event);
    }
}
