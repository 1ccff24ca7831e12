//! JSON-RPC 2.0 wire types and protocol constants
//!
//! The bridge forwards MCP traffic opaquely, so only the JSON-RPC envelope
//! itself is typed; `params` and `result` stay as raw [`serde_json::Value`]
//! trees. All `Option<>` fields omit their key from JSON when `None` via
//! `#[serde(skip_serializing_if = "Option::is_none")]`.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// JSON-RPC method constants
// ---------------------------------------------------------------------------

/// Lifecycle: client sends `initialize` to open a session.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Lifecycle: client sends `notifications/initialized` after the server ACKs.
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
/// Request a page of available tools.
pub const METHOD_TOOLS_LIST: &str = "tools/list";
/// Invoke a named tool.
pub const METHOD_TOOLS_CALL: &str = "tools/call";
/// Keepalive ping.
pub const METHOD_PING: &str = "ping";

// ---------------------------------------------------------------------------
// JSON-RPC error codes
// ---------------------------------------------------------------------------

/// Invalid JSON was received by the server.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist or is not available.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;
/// Implementation-defined: the adapter died while the call was pending.
pub const ADAPTER_TERMINATED: i64 = -32000;
/// Implementation-defined: the per-call deadline expired.
pub const REQUEST_TIMEOUT: i64 = -32001;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request object.
///
/// `jsonrpc` MUST always be `"2.0"`. `id` is `None` for notifications.
///
/// # Examples
///
/// ```
/// use mcp_bridge::rpc::JsonRpcRequest;
///
/// let req = JsonRpcRequest {
///     jsonrpc: "2.0".to_string(),
///     id: Some(serde_json::json!(7)),
///     method: "tools/list".to_string(),
///     params: None,
/// };
/// assert!(!req.is_notification());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version identifier; always `"2.0"`.
    pub jsonrpc: String,
    /// Request correlation identifier. Present for requests, absent for
    /// notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// The method name to invoke.
    pub method: String,
    /// Optional method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Parse and validate a request envelope from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::BridgeError::Parse`] if the body is not valid
    /// JSON, the `jsonrpc` field is not `"2.0"`, or `method` is missing.
    pub fn from_slice(body: &[u8]) -> Result<Self, crate::error::BridgeError> {
        let req: JsonRpcRequest = serde_json::from_slice(body)
            .map_err(|e| crate::error::BridgeError::Parse(e.to_string()))?;
        if req.jsonrpc != "2.0" {
            return Err(crate::error::BridgeError::Parse(format!(
                "unsupported jsonrpc version: {}",
                req.jsonrpc
            )));
        }
        if req.method.is_empty() {
            return Err(crate::error::BridgeError::Parse(
                "missing method".to_string(),
            ));
        }
        Ok(req)
    }

    /// True when this request is a notification (no `id`, or a null `id`).
    pub fn is_notification(&self) -> bool {
        match &self.id {
            None => true,
            Some(v) => v.is_null(),
        }
    }
}

/// A JSON-RPC 2.0 response object.
///
/// Exactly one of `result` or `error` is present in a valid response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version identifier; always `"2.0"`.
    pub jsonrpc: String,
    /// Mirrors the `id` from the corresponding request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// Successful result value; mutually exclusive with `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error object; mutually exclusive with `result`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build a success response carrying `result` under the caller's `id`.
    pub fn result(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response under the caller's `id`.
    pub fn error(id: Option<serde_json::Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A JSON-RPC 2.0 error object.
///
/// Implements `Display` as `"JSON-RPC error {code}: {message}"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code as defined by JSON-RPC 2.0 or this bridge.
    pub code: i64,
    /// Human-readable error description.
    pub message: String,
    /// Optional additional error context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip_omits_absent_fields() {
        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: "notifications/initialized".to_string(),
            params: None,
        };
        let raw = serde_json::to_string(&req).unwrap();
        assert!(!raw.contains("\"id\""));
        assert!(!raw.contains("\"params\""));
    }

    #[test]
    fn test_from_slice_accepts_valid_request() {
        let body = br#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#;
        let req = JsonRpcRequest::from_slice(body).unwrap();
        assert_eq!(req.method, "tools/list");
        assert_eq!(req.id, Some(serde_json::json!(7)));
        assert!(!req.is_notification());
    }

    #[test]
    fn test_from_slice_rejects_bad_json() {
        let result = JsonRpcRequest::from_slice(b"{not json");
        assert!(matches!(
            result,
            Err(crate::error::BridgeError::Parse(_))
        ));
    }

    #[test]
    fn test_from_slice_rejects_wrong_version() {
        let body = br#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#;
        let result = JsonRpcRequest::from_slice(body);
        assert!(matches!(
            result,
            Err(crate::error::BridgeError::Parse(_))
        ));
    }

    #[test]
    fn test_notification_detection() {
        let body = br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let req = JsonRpcRequest::from_slice(body).unwrap();
        assert!(req.is_notification());

        let body = br#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#;
        let req = JsonRpcRequest::from_slice(body).unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn test_response_builders() {
        let ok = JsonRpcResponse::result(Some(serde_json::json!(3)), serde_json::json!({"a":1}));
        assert_eq!(ok.id, Some(serde_json::json!(3)));
        assert!(ok.error.is_none());

        let err = JsonRpcResponse::error(Some(serde_json::json!("abc")), INVALID_PARAMS, "nope");
        assert_eq!(err.error.as_ref().unwrap().code, INVALID_PARAMS);
        assert!(err.result.is_none());
    }

    #[test]
    fn test_error_display() {
        let e = JsonRpcError {
            code: -32600,
            message: "Invalid Request".to_string(),
            data: None,
        };
        assert_eq!(e.to_string(), "JSON-RPC error -32600: Invalid Request");
    }
}
