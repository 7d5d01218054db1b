//! Thread and turn requests.
//!
//! Thread and turn ids are opaque tokens returned by the agent; they are
//! only ever echoed back.

use serde_json::{json, Value};

use crate::events::fields::{str_field, thread_id, turn_id};
use crate::rpc::{methods, Connection};
use crate::{AppError, Result};

/// User input for `turn/start`.
#[must_use]
pub fn text_input(text: &str) -> Value {
    json!([{ "type": "text", "text": text }])
}

/// Start a new thread and return its id.
///
/// # Errors
///
/// RPC errors, or [`AppError::Protocol`] if the result carries no id.
pub async fn start_thread(conn: &Connection, params: Value) -> Result<String> {
    let result = conn.request(methods::THREAD_START, Some(params)).await?;
    thread_id(&result)
        .ok_or_else(|| AppError::Protocol("thread/start result has no thread id".into()))
}

/// Resume a thread by id and return the id the agent reports.
///
/// # Errors
///
/// RPC errors, or [`AppError::Protocol`] if the result carries no id.
pub async fn resume_thread(conn: &Connection, thread: &str) -> Result<String> {
    let result = conn
        .request(methods::THREAD_RESUME, Some(json!({ "threadId": thread })))
        .await?;
    Ok(thread_id(&result).unwrap_or_else(|| thread.to_owned()))
}

/// Parameters for `turn/start`.
#[must_use]
pub fn turn_start_params(thread: &str, input: Value, overrides: Option<&Value>) -> Value {
    let mut params = json!({ "threadId": thread, "input": input });
    if let (Some(Value::Object(extra)), Value::Object(obj)) = (overrides, &mut params) {
        for (key, value) in extra {
            obj.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    params
}

/// Extract the turn id from a `turn/start` result.
///
/// # Errors
///
/// [`AppError::Protocol`] if the result carries no turn id.
pub fn turn_id_from_result(result: &Value) -> Result<String> {
    turn_id(result)
        .or_else(|| str_field(result, "id", "id"))
        .ok_or_else(|| AppError::Protocol("turn/start result has no turn id".into()))
}

/// Ask the agent to interrupt a turn. Best-effort; the response is not awaited.
///
/// # Errors
///
/// Returns a transport error if the request could not be written.
pub async fn interrupt_turn(conn: &Connection, thread: &str, turn: &str) -> Result<()> {
    conn.send_request(
        methods::TURN_INTERRUPT,
        Some(json!({ "threadId": thread, "turnId": turn })),
    )
    .await
    .map(drop)
}
