use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// JSON-RPC 2.0 protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC request structure. A request without an id is a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonValue>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl JsonRpcRequest {
    pub fn new(id: JsonValue, method: impl Into<String>, params: Option<JsonValue>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<JsonValue>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: JsonValue, result: JsonValue) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: JsonValue, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Unwraps the result payload, turning a JSON-RPC error into an MCP error.
    pub fn into_result(self, context: &str) -> Result<JsonValue> {
        if let Some(error) = self.error {
            return Err(Error::mcp(format!(
                "{} failed ({}): {}",
                context, error.code, error.message
            )));
        }
        Ok(self.result.unwrap_or(JsonValue::Null))
    }
}

/// JSON-RPC error structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl JsonRpcError {
    pub const METHOD_NOT_FOUND: i32 = -32601;

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: Self::METHOD_NOT_FOUND,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }
}

/// Protocol message that can be either a request or response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProtocolMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl ProtocolMessage {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::mcp(format!("Failed to parse protocol message: {}", e)))
    }

    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::mcp(format!("Failed to serialize protocol message: {}", e)))
    }

    pub fn is_response_to(&self, id: &JsonValue) -> bool {
        matches!(self, ProtocolMessage::Response(resp) if &resp.id == id)
    }
}

/// Hands out request ids for one connection.
#[derive(Debug, Default)]
pub struct ProtocolHandler {
    next_id: AtomicU64,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_request(&self, method: &str, params: Option<JsonValue>) -> JsonRpcRequest {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        JsonRpcRequest::new(JsonValue::from(id), method, params)
    }

    pub fn create_notification(&self, method: &str, params: Option<JsonValue>) -> JsonRpcRequest {
        JsonRpcRequest::notification(method, params)
    }
}
