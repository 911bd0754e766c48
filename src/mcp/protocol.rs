//! JSON-RPC 2.0 framing for MCP messages
//!
//! The envelope is framed here; payloads and error codes come from
//! `rmcp::model`.

use rmcp::model::{ErrorCode, ErrorData, ProtocolVersion};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const SUPPORTED_PROTOCOL_VERSIONS: [ProtocolVersion; 3] = [
    ProtocolVersion::V_2024_11_05,
    ProtocolVersion::V_2025_03_26,
    ProtocolVersion::V_2025_06_18,
];

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_PING: &str = "ping";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";

/// Transport-level rejection (not initialized, bad headers)
pub const SERVER_ERROR: ErrorCode = ErrorCode(-32000);
pub const SESSION_NOT_FOUND: ErrorCode = ErrorCode(-32001);

/// Inbound client message. A missing `id` marks a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_initialize(&self) -> bool {
        self.method == METHOD_INITIALIZE && !self.is_notification()
    }

    /// Parse one message from a request body
    pub fn from_slice(body: &[u8]) -> Result<Self, FramingError> {
        let value: Value = serde_json::from_slice(body).map_err(FramingError::Parse)?;
        if value.is_array() {
            return Err(FramingError::BatchUnsupported);
        }
        // `"id": null` would otherwise decode as an absent id
        match value.get("id") {
            None | Some(Value::String(_)) | Some(Value::Number(_)) => {}
            Some(_) => return Err(FramingError::InvalidId),
        }
        let request: Self = serde_json::from_value(value).map_err(FramingError::Invalid)?;
        if request.jsonrpc != JSONRPC_VERSION {
            return Err(FramingError::Version(request.jsonrpc));
        }
        Ok(request)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Parse error: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("Invalid Request: {0}")]
    Invalid(#[source] serde_json::Error),
    #[error("Invalid Request: id must be a string or number")]
    InvalidId,
    #[error("Invalid Request: unsupported jsonrpc version `{0}`")]
    Version(String),
    #[error("Invalid Request: batch messages are not supported")]
    BatchUnsupported,
}

impl FramingError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FramingError::Parse(_) => ErrorCode::PARSE_ERROR,
            _ => ErrorCode::INVALID_REQUEST,
        }
    }
}

/// Outbound message: exactly one of `result` / `error` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Success carrying a typed result; encoding failures become an internal error
    pub fn encode<T: Serialize>(id: Value, result: &T) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self::success(id, value),
            Err(e) => {
                tracing::error!("Failed to encode result: {}", e);
                Self::failure(id, ErrorData::internal_error("Internal error", None))
            }
        }
    }

    pub fn failure(id: Value, error: ErrorData) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Pick the protocol revision to answer `initialize` with
pub fn negotiate_protocol_version(requested: Option<&str>) -> ProtocolVersion {
    requested
        .and_then(|v| {
            SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .find(|s| s.to_string() == v)
        })
        .cloned()
        .unwrap_or(ProtocolVersion::LATEST)
}
