use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// JSON-RPC 2.0 error codes
// ---------------------------------------------------------------------------

pub const INVALID_REQUEST: i32 = -32600;
pub const INVALID_PARAMS: i32 = -32602;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A response synthesized by the proxy itself. Worker responses are never
/// decoded into this type; they pass through as raw lines.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Serialize to a single NDJSON line (no trailing newline).
    pub fn to_line(&self) -> String {
        // Every field is a plain string, number or Value; this cannot fail.
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"jsonrpc":"2.0","id":null,"error":{{"code":-32603,"message":"serialization error: {e}"}}}}"#
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Message inspection helpers
// ---------------------------------------------------------------------------

pub fn method(msg: &Value) -> Option<&str> {
    msg.get("method").and_then(Value::as_str)
}

pub fn id(msg: &Value) -> Option<&Value> {
    msg.get("id").filter(|v| !v.is_null())
}

/// A request carries both `method` and `id`.
pub fn is_request(msg: &Value) -> bool {
    method(msg).is_some() && id(msg).is_some()
}

/// A notification carries `method` but no `id`.
pub fn is_notification(msg: &Value) -> bool {
    method(msg).is_some() && msg.get("id").is_none()
}
