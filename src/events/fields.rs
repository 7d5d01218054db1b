//! Field lookup across protocol revisions.
//!
//! Revisions spell the same field in camelCase or snake_case. Lookups try
//! camelCase first; the snake_case spelling is used only when the camelCase
//! one is absent or `null`.

use serde_json::Value;

use crate::events::{Item, TokenUsage};

/// Look up a field by its camelCase then snake_case spelling.
pub(crate) fn field<'a>(params: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    params
        .get(camel)
        .filter(|v| !v.is_null())
        .or_else(|| params.get(snake).filter(|v| !v.is_null()))
}

/// String-valued [`field`].
pub(crate) fn str_field(params: &Value, camel: &str, snake: &str) -> Option<String> {
    field(params, camel, snake)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Thread id from `threadId` / `thread_id` / `conversationId` / `thread.id`.
pub(crate) fn thread_id(params: &Value) -> Option<String> {
    str_field(params, "threadId", "thread_id")
        .or_else(|| str_field(params, "conversationId", "conversation_id"))
        .or_else(|| params.get("thread").and_then(|t| str_field(t, "id", "id")))
}

/// Turn id from `turnId` / `turn_id` / `turn.id`.
pub(crate) fn turn_id(params: &Value) -> Option<String> {
    str_field(params, "turnId", "turn_id")
        .or_else(|| params.get("turn").and_then(|t| str_field(t, "id", "id")))
}

/// Decode token usage from either spelling. Returns `None` for non-objects.
pub(crate) fn token_usage(value: &Value) -> Option<TokenUsage> {
    if !value.is_object() {
        return None;
    }
    let num = |camel: &str, snake: &str| field(value, camel, snake).and_then(Value::as_u64);
    Some(TokenUsage {
        input_tokens: num("inputTokens", "input_tokens").unwrap_or(0),
        cached_input_tokens: num("cachedInputTokens", "cached_input_tokens").unwrap_or(0),
        output_tokens: num("outputTokens", "output_tokens").unwrap_or(0),
        reasoning_output_tokens: num("reasoningOutputTokens", "reasoning_output_tokens")
            .unwrap_or(0),
        total_tokens: num("totalTokens", "total_tokens"),
    })
}

/// Decode an item object. Requires a string `id` and a `type`.
pub(crate) fn item(value: &Value) -> Option<Item> {
    let id = str_field(value, "id", "id")?;
    let kind = str_field(value, "type", "type")
        .or_else(|| str_field(value, "itemType", "item_type"))?;
    let text = str_field(value, "text", "text");
    Some(Item {
        id,
        kind,
        text,
        raw: value.clone(),
    })
}

/// Collapse a diff payload into a single unified-diff string.
///
/// Accepts a plain string, an object carrying the diff under
/// `unifiedDiff` / `unified_diff` / `diff`, an array of such values, or a
/// map from path to per-file change. Returns `None` for anything else.
pub(crate) fn unified_diff(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                push_diff(&mut out, &unified_diff(part)?);
            }
            Some(out)
        }
        Value::Object(obj) => {
            if let Some(inner) = field(value, "unifiedDiff", "unified_diff")
                .or_else(|| obj.get("diff").filter(|v| !v.is_null()))
            {
                return unified_diff(inner);
            }
            if obj.is_empty() {
                return None;
            }
            let mut out = String::new();
            for change in obj.values() {
                push_diff(&mut out, &unified_diff(change)?);
            }
            Some(out)
        }
        _ => None,
    }
}

fn push_diff(out: &mut String, part: &str) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(part);
}
