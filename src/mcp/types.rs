/*
 * Copyright (C) 2026 Gantry contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! MCP (Model Context Protocol) type definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// JSON-RPC request (client-to-server or server-to-client).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// The JSON-RPC version.
    pub jsonrpc: String,
    /// The request ID.
    pub id: RequestId,
    /// The method name.
    pub method: String,
    /// The request parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC notification (incoming from client or outgoing from server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// The JSON-RPC version.
    pub jsonrpc: String,
    /// The method name.
    pub method: String,
    /// The notification parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    /// Builds a `notifications/progress` message for the given token.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the params cannot be converted to
    /// JSON (practically unreachable for these types).
    pub fn progress(params: &ProgressParams) -> Result<Self, serde_json::Error> {
        Ok(Self {
            jsonrpc: "2.0".to_string(),
            method: "notifications/progress".to_string(),
            params: Some(serde_json::to_value(params)?),
        })
    }
}

/// Request ID can be string or number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// A numeric ID.
    Number(i64),
    /// A string ID.
    String(String),
}

/// Client-chosen opaque id correlating a request with its progress stream.
///
/// Carried in `params._meta.progressToken`; accepts either a string or a
/// number. Doubles as the operations-registry key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ProgressToken {
    /// A numeric token.
    Number(i64),
    /// A string token.
    String(String),
}

impl ProgressToken {
    /// Recovers a token from its string form, mapping all-digit ids back
    /// to numeric tokens so `Display` and `parse` round-trip.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        s.parse::<i64>()
            .map_or_else(|_| Self::String(s.to_string()), Self::Number)
    }
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ProgressToken {
    fn from(token: &str) -> Self {
        Self::String(token.to_string())
    }
}

impl From<i64> for ProgressToken {
    fn from(token: i64) -> Self {
        Self::Number(token)
    }
}

/// Params of an outgoing `notifications/progress` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    /// Token the client supplied in `_meta.progressToken`.
    pub progress_token: ProgressToken,
    /// Work completed so far.
    pub progress: f64,
    /// Total work expected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Latest human-readable status line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// JSON-RPC response (client-to-server or server-to-client).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// The JSON-RPC version.
    pub jsonrpc: String,
    /// The request ID.
    pub id: RequestId,
    /// The result of the request, if successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error, if the request failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    /// Creates a successful response.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the result cannot be converted to JSON.
    pub fn success(id: RequestId, result: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(serde_json::to_value(result)?),
            error: None,
        })
    }

    /// Creates an error response.
    pub fn error(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Creates an error response from a classified bridge error, mapping
    /// the taxonomy onto the wire codes.
    pub fn from_error(id: RequestId, error: &Error) -> Self {
        Self::error(id, error_code(error), error.to_string())
    }
}

/// JSON-RPC response error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    /// The error code.
    pub code: i64,
    /// The error message.
    pub message: String,
    /// Additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method was not found.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// An internal error occurred.
pub const INTERNAL_ERROR: i64 = -32603;
/// Authentication against the upstream failed.
pub const AUTH_FAILED: i64 = -32000;
/// The caller is being rate limited.
pub const RATE_LIMITED: i64 = -32001;
/// The requested protocol version is not supported.
pub const VERSION_UNSUPPORTED: i64 = -32002;
/// The referenced resource does not exist.
pub const RESOURCE_NOT_FOUND: i64 = -32003;
/// The requested operation failed.
pub const OPERATION_FAILED: i64 = -32004;

/// Maps a classified bridge error onto a JSON-RPC error code.
#[must_use]
pub const fn error_code(error: &Error) -> i64 {
    match error {
        Error::Validation(_) => INVALID_PARAMS,
        Error::NotFound(_) => RESOURCE_NOT_FOUND,
        Error::Aborted(_) | Error::Upstream { .. } => OPERATION_FAILED,
        Error::Internal(_) => INTERNAL_ERROR,
    }
}

/// MCP initialize request params.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(
    dead_code,
    reason = "Fields required by MCP protocol but not all are read"
)]
pub struct InitializeParams {
    /// The protocol version requested by the client.
    pub protocol_version: String,
    /// The capabilities of the client.
    #[serde(default)]
    pub capabilities: Option<Value>,
    /// Information about the client.
    pub client_info: ClientInfo,
}

/// Information about the MCP client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientInfo {
    /// The name of the client.
    pub name: String,
    /// The version of the client.
    #[serde(default)]
    pub version: Option<String>,
}

/// MCP initialize response result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// The protocol version supported by the server.
    pub protocol_version: String,
    /// The capabilities of the server.
    pub capabilities: ServerCapabilities,
    /// Information about the server.
    pub server_info: ServerInfo,
    /// Optional instructions for the client on how to use this server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// MCP server capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tools-related capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    /// Resources-related capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
}

/// Tools-related capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    /// Whether the server supports listing changed tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Information about the MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// The name of the server.
    pub name: String,
    /// The version of the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Tool definition for tools/list response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// The unique name of the tool.
    pub name: String,
    /// A human-readable description of the tool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The JSON schema for the tool's input.
    pub input_schema: Value,
}

/// tools/list response result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    /// The list of available tools.
    pub tools: Vec<Tool>,
}

/// Request metadata riding alongside tool arguments.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallMeta {
    /// Token correlating this call with a progress stream.
    #[serde(default, rename = "progressToken")]
    pub progress_token: Option<ProgressToken>,
}

/// tools/call request params.
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolParams {
    /// The name of the tool to call.
    pub name: String,
    /// The arguments for the tool call.
    #[serde(default)]
    pub arguments: Option<Value>,
    /// Protocol metadata (`_meta`).
    #[serde(default, rename = "_meta")]
    pub meta: Option<CallMeta>,
}

impl CallToolParams {
    /// The client-supplied progress token, if any.
    #[must_use]
    pub fn progress_token(&self) -> Option<ProgressToken> {
        self.meta
            .as_ref()
            .and_then(|meta| meta.progress_token.clone())
    }
}

/// tools/call response result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    /// The content returned from the tool call.
    pub content: Vec<ToolContent>,
    /// Whether the tool call resulted in an error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// Content returned from a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToolContent {
    /// Text content.
    Text {
        /// The text content.
        text: String,
    },
}

impl CallToolResult {
    /// Creates a successful tool result with text content.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: None,
        }
    }

    /// Creates an error tool result with an error message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            is_error: Some(true),
        }
    }
}

/// Params of a `POST /mcp/resource` fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceParams {
    /// Resource URI, e.g. `maas://machine/abc123`.
    pub uri: String,
}

/// One block of resource content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    /// The URI the content was fetched from.
    pub uri: String,
    /// MIME type of the content.
    pub mime_type: String,
    /// The content itself.
    pub text: String,
}

/// Resource fetch result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceResult {
    /// The fetched content blocks.
    pub contents: Vec<ResourceContents>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[test]
    fn test_deserialize_initialize_params() -> Result<()> {
        let json = r#"{
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {
                "name": "test-client",
                "version": "1.0.0"
            }
        }"#;

        let params: InitializeParams = serde_json::from_str(json)?;
        assert_eq!(params.protocol_version, "2024-11-05");
        assert_eq!(params.client_info.name, "test-client");
        Ok(())
    }

    #[test]
    fn test_serialize_initialize_result() -> Result<()> {
        let result = InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: None }),
                resources: None,
            },
            server_info: ServerInfo {
                name: "gantry".to_string(),
                version: Some("0.1.0".to_string()),
            },
            instructions: None,
        };

        let json = serde_json::to_string(&result)?;
        assert!(json.contains("protocolVersion"));
        assert!(json.contains("gantry"));
        Ok(())
    }

    #[test]
    fn test_progress_token_accepts_string_or_number() -> Result<()> {
        let token: ProgressToken = serde_json::from_str("42")?;
        assert_eq!(token, ProgressToken::Number(42));
        assert_eq!(token.to_string(), "42");

        let token: ProgressToken = serde_json::from_str(r#""deploy-7""#)?;
        assert_eq!(token, ProgressToken::String("deploy-7".to_string()));
        assert_eq!(token.to_string(), "deploy-7");
        Ok(())
    }

    #[test]
    fn test_progress_token_parse_round_trips_display() {
        assert_eq!(ProgressToken::parse("42"), ProgressToken::Number(42));
        assert_eq!(
            ProgressToken::parse("deploy-7"),
            ProgressToken::from("deploy-7")
        );
        let token = ProgressToken::Number(-3);
        assert_eq!(ProgressToken::parse(&token.to_string()), token);
    }

    #[test]
    fn test_call_params_meta_token_extraction() -> Result<()> {
        let json = r#"{
            "name": "deploy_machine",
            "arguments": {"system_id": "abc123"},
            "_meta": {"progressToken": "op-1"}
        }"#;
        let params: CallToolParams = serde_json::from_str(json)?;
        assert_eq!(params.progress_token(), Some(ProgressToken::from("op-1")));

        let json = r#"{"name": "list_machines"}"#;
        let params: CallToolParams = serde_json::from_str(json)?;
        assert!(params.progress_token().is_none());
        Ok(())
    }

    #[test]
    fn test_progress_notification_shape() -> Result<()> {
        let notification = Notification::progress(&ProgressParams {
            progress_token: ProgressToken::Number(9),
            progress: 30.0,
            total: Some(100.0),
            message: Some("deploying".to_string()),
        })?;

        let json = serde_json::to_value(&notification)?;
        assert_eq!(json["method"], "notifications/progress");
        assert_eq!(json["params"]["progressToken"], 9);
        assert_eq!(json["params"]["progress"], 30.0);
        assert_eq!(json["params"]["total"], 100.0);
        Ok(())
    }

    #[test]
    fn test_call_tool_result_text() -> Result<()> {
        let result = CallToolResult::text("Hello, world!");
        let json = serde_json::to_string(&result)?;
        assert!(json.contains("Hello, world!"));
        assert!(!json.contains("isError"));
        Ok(())
    }

    #[test]
    fn test_call_tool_result_error() -> Result<()> {
        let result = CallToolResult::error("Something went wrong");
        let json = serde_json::to_string(&result)?;
        assert!(json.contains("isError"));
        assert!(json.contains("true"));
        Ok(())
    }

    #[test]
    fn test_response_success() -> Result<()> {
        let resp = Response::success(RequestId::Number(1), serde_json::json!({"ok": true}))?;
        let json = serde_json::to_string(&resp)?;
        assert!(json.contains("result"));
        assert!(!json.contains("error"));
        Ok(())
    }

    #[test]
    fn test_response_error() -> Result<()> {
        let resp = Response::error(RequestId::Number(1), METHOD_NOT_FOUND, "Unknown method");
        let json = serde_json::to_string(&resp)?;
        assert!(json.contains("error"));
        assert!(json.contains("-32601"));
        assert!(!json.contains("result"));
        Ok(())
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            error_code(&Error::Validation("bad".to_string())),
            INVALID_PARAMS
        );
        assert_eq!(error_code(&Error::not_found("machine")), RESOURCE_NOT_FOUND);
        assert_eq!(error_code(&Error::upstream("boom")), OPERATION_FAILED);
    }

    /// Regression: the MCP TypeScript SDK rejects `"params": null` with a
    /// ZodError ("expected object, received null"). Requests and notifications
    /// with no params must omit the field entirely instead of serializing null.
    #[test]
    fn test_none_params_omitted_not_null() -> Result<()> {
        let req = Request {
            jsonrpc: "2.0".to_string(),
            id: RequestId::String("gantry-0".to_string()),
            method: "tools/list".to_string(),
            params: None,
        };
        let json = serde_json::to_string(&req)?;
        assert!(
            !json.contains("params"),
            "Request with params: None must omit the field, got: {json}"
        );

        let notification = Notification {
            jsonrpc: "2.0".to_string(),
            method: "notifications/tools/list_changed".to_string(),
            params: None,
        };
        let json = serde_json::to_string(&notification)?;
        assert!(
            !json.contains("params"),
            "Notification with params: None must omit the field, got: {json}"
        );

        Ok(())
    }

    #[test]
    fn test_deserialize_response_error() -> Result<()> {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": "gantry-0",
            "error": {"code": -32601, "message": "not found"}
        }"#;
        let resp: Response = serde_json::from_str(json)?;
        assert!(resp.result.is_none());
        let err = resp.error.as_ref().context("missing error")?;
        assert_eq!(err.code, METHOD_NOT_FOUND);
        Ok(())
    }
}
