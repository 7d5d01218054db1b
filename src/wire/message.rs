//! JSON-RPC-like envelope classification and encoding.
//!
//! Dialect B messages share one envelope shape:
//!
//! | Kind          | Fields                                   |
//! |---------------|------------------------------------------|
//! | request       | `id` + `method` (+ `params`)             |
//! | response      | `id` + `result` **or** `error`           |
//! | notification  | `method` (+ `params`), no `id`           |
//!
//! Ids may be integers or strings depending on which side allocated them.
//! The optional `jsonrpc` version marker is emitted only when the configured
//! [`ProtocolRevision`] defines it.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// JSON-RPC error code: method not found.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error code: invalid params.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC error code: internal error.
pub const INTERNAL_ERROR: i64 = -32603;

/// Request correlation id (integer or string, per wire dialect).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id (allocated by this client).
    Int(i64),
    /// String id (some agents allocate these for server requests).
    Str(String),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

/// JSON-RPC error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    /// Build an error object without data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// One decoded Dialect B message.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// Server-originated request that must be answered.
    Request {
        /// Correlation id chosen by the server.
        id: RequestId,
        /// Method name.
        method: String,
        /// Parameters (`Null` when absent).
        params: Value,
    },
    /// Answer to a request this client sent.
    Response {
        /// Correlation id of the original request.
        id: RequestId,
        /// `Ok(result)` or `Err(error)`.
        outcome: std::result::Result<Value, RpcErrorObject>,
    },
    /// Fire-and-forget message.
    Notification {
        /// Method name.
        method: String,
        /// Parameters (`Null` when absent).
        params: Value,
    },
}

impl RpcMessage {
    /// Classify a decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] when the value is not an object or
    /// matches none of the three envelope shapes (for example a response
    /// whose `id` is `null`).
    pub fn classify(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            return Err(AppError::Protocol("message is not a JSON object".into()));
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(serde_json::from_value::<RequestId>(raw).map_err(|e| {
                AppError::Protocol(format!("id must be an integer or string: {e}"))
            })?),
        };
        let method = match obj.remove("method") {
            None => None,
            Some(Value::String(m)) => Some(m),
            Some(_) => return Err(AppError::Protocol("method must be a string".into())),
        };
        let params = obj.remove("params").unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (None, Some(method)) => Ok(Self::Notification { method, params }),
            (Some(id), None) => {
                if let Some(err) = obj.remove("error") {
                    let err: RpcErrorObject = serde_json::from_value(err).map_err(|e| {
                        AppError::Protocol(format!("malformed error object: {e}"))
                    })?;
                    Ok(Self::Response {
                        id,
                        outcome: Err(err),
                    })
                } else if let Some(result) = obj.remove("result") {
                    Ok(Self::Response {
                        id,
                        outcome: Ok(result),
                    })
                } else {
                    Err(AppError::Protocol(format!(
                        "message with id {id} has neither method, result nor error"
                    )))
                }
            }
            (None, None) => Err(AppError::Protocol(
                "message has neither id nor method".into(),
            )),
        }
    }
}

/// Envelope fields that vary across protocol revisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProtocolRevision {
    /// Value of the `jsonrpc` field; omitted from every envelope when `None`.
    #[serde(default)]
    pub jsonrpc: Option<String>,
}

impl ProtocolRevision {
    /// Encode a client request.
    #[must_use]
    pub fn request(&self, id: &RequestId, method: &str, params: Option<Value>) -> Value {
        let mut obj = self.envelope();
        obj.insert("id".into(), id_value(id));
        obj.insert("method".into(), Value::String(method.to_owned()));
        if let Some(params) = params {
            obj.insert("params".into(), params);
        }
        Value::Object(obj)
    }

    /// Encode a client notification.
    #[must_use]
    pub fn notification(&self, method: &str, params: Option<Value>) -> Value {
        let mut obj = self.envelope();
        obj.insert("method".into(), Value::String(method.to_owned()));
        if let Some(params) = params {
            obj.insert("params".into(), params);
        }
        Value::Object(obj)
    }

    /// Encode a successful response to a server request.
    #[must_use]
    pub fn response(&self, id: &RequestId, result: Value) -> Value {
        let mut obj = self.envelope();
        obj.insert("id".into(), id_value(id));
        obj.insert("result".into(), result);
        Value::Object(obj)
    }

    /// Encode an error response to a server request.
    #[must_use]
    pub fn error_response(&self, id: &RequestId, error: &RpcErrorObject) -> Value {
        let mut obj = self.envelope();
        obj.insert("id".into(), id_value(id));
        let mut err = Map::new();
        err.insert("code".into(), Value::from(error.code));
        err.insert("message".into(), Value::String(error.message.clone()));
        if let Some(data) = &error.data {
            err.insert("data".into(), data.clone());
        }
        obj.insert("error".into(), Value::Object(err));
        Value::Object(obj)
    }

    fn envelope(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        if let Some(version) = &self.jsonrpc {
            obj.insert("jsonrpc".into(), Value::String(version.clone()));
        }
        obj
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Int(n) => Value::from(*n),
        RequestId::Str(s) => Value::String(s.clone()),
    }
}
