//! JSON-RPC 2.0 handling for the MCP streamable-HTTP endpoint.
//!
//! Protocol methods (`initialize`, `tools/*`, `resources/*`) are handled
//! here; tool failures become MCP tool results with `isError: true` and a
//! stable `{code, message}` payload, while malformed requests get JSON-RPC
//! error objects.

use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::engine::Engine;
use crate::error::MailroomError;

use super::{resources, tools};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Handle one request. `None` means a notification with no response body.
pub async fn handle(engine: &Engine, raw: Value) -> Option<Value> {
    let request: RpcRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(err) => {
            return Some(error_response(
                Value::Null,
                PARSE_ERROR,
                &format!("malformed request: {err}"),
            ));
        }
    };
    let id = request.id.clone();
    debug!(method = %request.method, "rpc request");

    let result = match request.method.as_str() {
        "initialize" => json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "listChanged": false },
            },
            "serverInfo": {
                "name": "mailroom",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
        "ping" => json!({}),
        "notifications/initialized" | "notifications/cancelled" => return None,
        "tools/list" => json!({ "tools": tools::catalog() }),
        "tools/call" => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Some(error_response(
                        id?,
                        INVALID_PARAMS,
                        "tools/call requires params",
                    ))
                }
            };
            let name = params
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string();
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            let deadline = default_deadline(engine);
            match tools::dispatch(engine, &name, arguments, deadline).await {
                Ok(value) => tool_result(value, false),
                Err(err) => tool_error(&err),
            }
        }
        "resources/list" => json!({ "resources": resources::catalog() }),
        "resources/read" => {
            let uri = request
                .params
                .as_ref()
                .and_then(|p| p.get("uri"))
                .and_then(|u| u.as_str())
                .unwrap_or_default()
                .to_string();
            match resources::read(engine, &uri).await {
                Ok(value) => {
                    let text = value.to_string();
                    json!({
                        "contents": [{
                            "uri": uri,
                            "mimeType": "application/json",
                            "text": text,
                        }]
                    })
                }
                Err(err) => {
                    return Some(error_response(id?, INVALID_PARAMS, &err.to_string()));
                }
            }
        }
        other => {
            return Some(error_response(
                id?,
                METHOD_NOT_FOUND,
                &format!("unknown method '{other}'"),
            ));
        }
    };

    // Requests without an id are notifications even on success.
    let id = id?;
    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

fn default_deadline(engine: &Engine) -> Option<Instant> {
    let secs = engine.settings().default_op_timeout_secs;
    (secs > 0).then(|| Instant::now() + Duration::from_secs(secs))
}

fn tool_result(value: Value, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": value.to_string() }],
        "structuredContent": value,
        "isError": is_error,
    })
}

fn tool_error(err: &MailroomError) -> Value {
    let payload = json!({
        "error": {
            "code": err.code().as_str(),
            "message": err.to_string(),
        }
    });
    tool_result(payload, true)
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}
