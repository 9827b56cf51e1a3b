//! MCP protocol types and message handling.
//!
//! JSON-RPC 2.0 envelopes plus the subset of Model Context Protocol payloads
//! this server speaks (`initialize`, `tools/list`, `tools/call`). See
//! https://modelcontextprotocol.io/specification for the full protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version string carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC request ID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum JsonRpcId {
    /// Numeric ID.
    Number(i64),
    /// String ID.
    String(String),
}

/// JSON-RPC 2.0 request. Without an `id` it is a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version (always "2.0").
    pub jsonrpc: String,
    /// Request ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    /// Method name.
    pub method: String,
    /// Parameters (if any).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Build a request with the given id.
    pub fn new(id: JsonRpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Whether this message expects no response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i32,
    /// Error message.
    pub message: String,
    /// Additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version (always "2.0").
    pub jsonrpc: String,
    /// Request ID (matches request, null for parse errors).
    pub id: Option<JsonRpcId>,
    /// Result (success case).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (failure case).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a success response.
    pub fn success(id: Option<JsonRpcId>, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self {
                jsonrpc: JSONRPC_VERSION.into(),
                id,
                result: Some(value),
                error: None,
            },
            Err(e) => Self::error(id, crate::error::codes::INTERNAL_ERROR, e.to_string()),
        }
    }

    /// Create an error response.
    pub fn error(id: Option<JsonRpcId>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Create an error response from a server error.
    pub fn from_error(id: Option<JsonRpcId>, err: &crate::Error) -> Self {
        Self::error(id, err.code(), err.to_string())
    }

    /// Whether this response carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Classified inbound message.
#[derive(Debug, Clone)]
pub enum McpMessage {
    /// Request message.
    Request(JsonRpcRequest),
    /// Notification (no ID, no response expected).
    Notification(JsonRpcRequest),
    /// Response to something we sent.
    Response(JsonRpcResponse),
}

impl McpMessage {
    /// Parse and classify a JSON string.
    pub fn parse(json: &str) -> crate::Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        if !value.is_object() {
            return Err(crate::Error::JsonRpc {
                code: crate::error::codes::INVALID_REQUEST,
                message: "message must be a JSON object".into(),
            });
        }

        if value.get("method").is_some() {
            let request: JsonRpcRequest = serde_json::from_value(value).map_err(invalid_request)?;
            if request.jsonrpc != JSONRPC_VERSION {
                return Err(crate::Error::JsonRpc {
                    code: crate::error::codes::INVALID_REQUEST,
                    message: format!("unsupported jsonrpc version: {}", request.jsonrpc),
                });
            }
            if request.is_notification() {
                Ok(McpMessage::Notification(request))
            } else {
                Ok(McpMessage::Request(request))
            }
        } else if value.get("result").is_some() || value.get("error").is_some() {
            Ok(McpMessage::Response(
                serde_json::from_value(value).map_err(invalid_request)?,
            ))
        } else {
            Err(crate::Error::JsonRpc {
                code: crate::error::codes::INVALID_REQUEST,
                message: "neither a request nor a response".into(),
            })
        }
    }
}

/// Valid JSON that is not a well-formed envelope.
fn invalid_request(err: serde_json::Error) -> crate::Error {
    crate::Error::JsonRpc {
        code: crate::error::codes::INVALID_REQUEST,
        message: format!("invalid request: {}", err),
    }
}

// ============================================================================
// MCP payloads
// ============================================================================

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version requested by the client.
    pub protocol_version: String,
    /// Client capabilities (opaque to this server).
    #[serde(default)]
    pub capabilities: Value,
    /// Client info.
    pub client_info: Implementation,
}

/// `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Negotiated protocol version.
    pub protocol_version: String,
    /// Server capabilities.
    pub capabilities: ServerCapabilities,
    /// Server info.
    pub server_info: Implementation,
    /// Free-form usage hints for the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Name and version of a protocol participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    /// Name.
    pub name: String,
    /// Version.
    pub version: String,
}

/// Server capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tools capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    /// Logging capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
}

/// Tools capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsCapability {
    /// Whether tool list changed notifications are supported.
    #[serde(rename = "listChanged", default)]
    pub list_changed: bool,
}

/// Tool definition for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Tool description.
    pub description: String,
    /// Input schema (JSON Schema).
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// `tools/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    /// Available tools.
    pub tools: Vec<ToolDefinition>,
}

/// `tools/call` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    /// Tool name.
    pub name: String,
    /// Tool arguments.
    #[serde(default)]
    pub arguments: Value,
}

/// `tools/call` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Result content.
    pub content: Vec<ContentItem>,
    /// Whether the tool encountered an error.
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Result holding a pretty-printed JSON payload.
    pub fn json(payload: &Value) -> crate::Result<Self> {
        Ok(Self {
            content: vec![ContentItem::text(serde_json::to_string_pretty(payload)?)],
            is_error: false,
        })
    }

    /// Attach an extra content item.
    pub fn with_item(mut self, item: ContentItem) -> Self {
        self.content.push(item);
        self
    }

    /// First text item, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|item| match item {
            ContentItem::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Content item in tool results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    /// Text content.
    Text {
        /// Text value.
        text: String,
    },
    /// Image content.
    Image {
        /// Base64-encoded image data.
        data: String,
        /// MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl ContentItem {
    /// Create a text content item.
    pub fn text(text: impl Into<String>) -> Self {
        ContentItem::Text { text: text.into() }
    }

    /// Create a base64 PNG image item from raw bytes.
    pub fn png(bytes: &[u8]) -> Self {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        ContentItem::Image {
            data: STANDARD.encode(bytes),
            mime_type: "image/png".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_requests_and_notifications() {
        let req = McpMessage::parse(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#).unwrap();
        assert!(matches!(req, McpMessage::Request(r) if r.id == Some(JsonRpcId::Number(7))));

        let note =
            McpMessage::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(matches!(note, McpMessage::Notification(_)));

        let resp = McpMessage::parse(r#"{"jsonrpc":"2.0","id":"a","result":{}}"#).unwrap();
        assert!(matches!(resp, McpMessage::Response(_)));
    }

    #[test]
    fn rejects_non_objects_and_garbage() {
        assert!(McpMessage::parse("[1,2]").is_err());
        assert!(McpMessage::parse("{not json").is_err());
        assert!(McpMessage::parse(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
    }

    #[test]
    fn malformed_envelopes_are_invalid_requests() {
        for line in [
            r#"{"id":1,"method":"ping"}"#,
            r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#,
            r#"{"jsonrpc":"2.0","id":1,"method":["ping"]}"#,
            r#"{"jsonrpc":"2.0","id":{"a":1},"result":{}}"#,
        ] {
            let err = McpMessage::parse(line).unwrap_err();
            assert_eq!(err.code(), crate::error::codes::INVALID_REQUEST, "{}", line);
        }
        assert_eq!(
            McpMessage::parse("{not json").unwrap_err().code(),
            crate::error::codes::PARSE_ERROR
        );
    }

    #[test]
    fn image_items_serialize_with_mime_type() {
        let item = ContentItem::png(&[0x89, b'P', b'N', b'G']);
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["type"], "image");
        assert_eq!(value["mimeType"], "image/png");
        assert_eq!(value["data"], "iVBORw==");
    }

    #[test]
    fn success_response_omits_error() {
        let resp = JsonRpcResponse::success(Some(JsonRpcId::String("x".into())), json!({"ok": true}));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["id"], "x");
        assert!(value.get("error").is_none());
    }
}
