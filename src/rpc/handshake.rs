//! Initialization handshake.
//!
//! Once the connection is open the client performs an LSP-style exchange
//! before any thread or turn request:
//!
//! 1. **`initialize`** request carrying `clientInfo` (and optional
//!    `capabilities`), awaited like any other call.
//! 2. **`initialized`** notification acknowledging the server's answer.
//!
//! Envelope fields such as `jsonrpc` come from the connection's
//! [`crate::wire::message::ProtocolRevision`]; nothing here hardcodes them.

use serde_json::{json, Map, Value};
use tracing::info;

use crate::rpc::{methods, Connection};
use crate::Result;

/// Identity announced in `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Human-readable title.
    pub title: Option<String>,
    /// Client version.
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_owned(),
            title: None,
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// Build `initialize` params.
///
/// ```json
/// { "clientInfo": { "name": "agent-conduit", "title": "…", "version": "0.1.0" } }
/// ```
#[must_use]
pub fn initialize_params(info: &ClientInfo, capabilities: Option<Value>) -> Value {
    let mut client = Map::new();
    client.insert("name".into(), Value::String(info.name.clone()));
    if let Some(title) = &info.title {
        client.insert("title".into(), Value::String(title.clone()));
    }
    client.insert("version".into(), Value::String(info.version.clone()));

    let mut params = json!({ "clientInfo": Value::Object(client) });
    if let Some(caps) = capabilities {
        params["capabilities"] = caps;
    }
    params
}

/// Run the handshake and return the server's `initialize` result.
///
/// # Errors
///
/// Any error from the `initialize` call or the `initialized` write.
pub async fn initialize(
    conn: &Connection,
    info: &ClientInfo,
    capabilities: Option<Value>,
) -> Result<Value> {
    let result = conn
        .request(methods::INITIALIZE, Some(initialize_params(info, capabilities)))
        .await?;
    conn.notify(methods::INITIALIZED, None).await?;

    let server = result
        .get("userAgent")
        .or_else(|| result.get("serverInfo"))
        .map(ToString::to_string)
        .unwrap_or_default();
    info!(client = %info.name, %server, "handshake complete");
    Ok(result)
}
