//! Wire frames for the gateway WebSocket protocol.
//!
//! Two compatible dialects are admitted on the same socket: JSON-RPC 2.0
//! (`{jsonrpc, id, method, params}`) and the internal req/res/event shape
//! (`{type:"req", id, method, params}`). Responses echo the client's `id`
//! verbatim and answer in the dialect the request used. Events always use
//! the `{type:"event", event, payload, seq}` shape.

use serde::Serialize;
use serde_json::{json, Value};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Screaming-snake error codes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "AUTH_REQUIRED")]
    AuthRequired,
    #[serde(rename = "AUTH_FAILED")]
    AuthFailed,
    #[serde(rename = "METHOD_NOT_FOUND")]
    MethodNotFound,
    #[serde(rename = "INVALID_REQUEST")]
    InvalidRequest,
    #[serde(rename = "PERMISSION_DENIED")]
    PermissionDenied,
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "HANDSHAKE_FAILED")]
    HandshakeFailed,
}

impl ErrorCode {
    /// The JSON-RPC 2.0 integer code for this error.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidRequest => -32602,
            _ => -32603,
        }
    }
}

/// Error payload on the wire: `{code, message, details?}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorShape {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorShape {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request frame
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which request dialect a frame arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    JsonRpc,
    Internal,
}

/// A parsed client request.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub dialect: Dialect,
    /// Echoed verbatim in the response; may be a string or an integer.
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl RequestFrame {
    /// Parse a text frame into a request, accepting both dialects.
    pub fn parse(raw: &str) -> Result<Self, ErrorShape> {
        let value: Value = serde_json::from_str(raw).map_err(|e| {
            ErrorShape::new(ErrorCode::InvalidRequest, format!("malformed JSON: {e}"))
        })?;

        let dialect = if value.get("jsonrpc").is_some() {
            Dialect::JsonRpc
        } else if value.get("type").and_then(|t| t.as_str()) == Some("req") {
            Dialect::Internal
        } else {
            return Err(ErrorShape::new(
                ErrorCode::InvalidRequest,
                "unknown frame shape (expected JSON-RPC or type:\"req\")",
            ));
        };

        let method = value
            .get("method")
            .and_then(|m| m.as_str())
            .ok_or_else(|| ErrorShape::new(ErrorCode::InvalidRequest, "missing method"))?
            .to_owned();

        Ok(Self {
            dialect,
            id: value.get("id").cloned().unwrap_or(Value::Null),
            method,
            params: value.get("params").cloned().unwrap_or(json!({})),
        })
    }

    /// Frame a success response in the request's dialect.
    pub fn response(&self, payload: Value) -> String {
        let frame = match self.dialect {
            Dialect::JsonRpc => json!({
                "jsonrpc": "2.0",
                "id": self.id,
                "result": payload,
            }),
            Dialect::Internal => json!({
                "type": "res",
                "id": self.id,
                "ok": true,
                "payload": payload,
            }),
        };
        frame.to_string()
    }

    /// Frame an error response in the request's dialect.
    pub fn error_response(&self, error: &ErrorShape) -> String {
        let frame = match self.dialect {
            Dialect::JsonRpc => json!({
                "jsonrpc": "2.0",
                "id": self.id,
                "error": {
                    "code": error.code.json_rpc_code(),
                    "message": error.message,
                },
            }),
            Dialect::Internal => json!({
                "type": "res",
                "id": self.id,
                "ok": false,
                "error": serde_json::to_value(error).unwrap_or(Value::Null),
            }),
        };
        frame.to_string()
    }
}

/// Frame a broadcast event.
pub fn event_frame(event: &str, payload: Value, seq: Option<u64>) -> String {
    let mut frame = json!({
        "type": "event",
        "event": event,
        "payload": payload,
    });
    if let Some(seq) = seq {
        frame["seq"] = json!(seq);
    }
    frame.to_string()
}
