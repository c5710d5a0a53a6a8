//! JSON-RPC envelopes, MCP method payloads, and normalization of server results.

use super::error::McpError;
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, ContentBlock, Implementation, InitializeResult,
    ListResourcesResult, ListToolsResult, ReadResourceRequestParams, Resource, ServerCapabilities,
    Tool, LATEST_PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
pub const METHOD_RESOURCES_READ: &str = "resources/read";

pub const CLIENT_NAME: &str = "mcpeek";

/// Outbound JSON-RPC request or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC `error` member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Inbound JSON-RPC response; the shape is validated before it reaches the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl JsonRpcResponse {
    /// Numeric correlation id, accepting servers that echo ids as strings.
    pub fn correlation_id(&self) -> Option<u64> {
        match self.id.as_ref()? {
            Value::Number(number) => number.as_u64(),
            Value::String(text) => text.parse().ok(),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<Value, McpError> {
        if let Some(error) = self.error {
            return Err(McpError::Protocol {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }

    /// Reads a JSON value as a response, rejecting requests and notifications.
    pub fn from_value(value: Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.contains_key("method") {
            return None;
        }
        if !object.contains_key("result") && !object.contains_key("error") {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}

/// Extracts every JSON-RPC response in a parsed payload (single object or batch).
pub fn responses_in(value: Value) -> Vec<JsonRpcResponse> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(JsonRpcResponse::from_value)
            .collect(),
        other => JsonRpcResponse::from_value(other).into_iter().collect(),
    }
}

pub fn requested_protocol_version(configured: Option<&str>) -> String {
    match configured {
        Some(version) if !version.trim().is_empty() => version.trim().to_string(),
        _ => LATEST_PROTOCOL_VERSION.to_string(),
    }
}

fn client_info() -> Implementation {
    Implementation {
        name: CLIENT_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        title: Some("mcpeek MCP client".to_string()),
        description: None,
        icons: Vec::new(),
        website_url: None,
    }
}

/// `initialize` params advertising sampling, elicitation, and roots support.
pub fn initialize_params(protocol_version: &str) -> Value {
    json!({
        "protocolVersion": protocol_version,
        "capabilities": {
            "sampling": {},
            "elicitation": {},
            "roots": { "listChanged": false }
        },
        "clientInfo": client_info(),
    })
}

pub fn list_params(cursor: Option<&str>) -> Option<Value> {
    cursor.map(|cursor| json!({ "cursor": cursor }))
}

pub fn call_tool_params(tool_name: &str, arguments: Option<Map<String, Value>>) -> Result<Value, McpError> {
    let mut params = CallToolRequestParams::new(tool_name);
    if let Some(arguments) = arguments {
        params = params.with_arguments(arguments);
    }
    Ok(serde_json::to_value(params)?)
}

pub fn read_resource_params(uri: &str) -> Result<Value, McpError> {
    let params = ReadResourceRequestParams {
        meta: None,
        uri: uri.to_string(),
    };
    Ok(serde_json::to_value(params)?)
}

/// Validates an `initialize` result; both the protocol version and server info are required.
///
/// Servers that omit `capabilities` are read as advertising none.
pub fn parse_initialize_result(mut value: Value) -> Result<InitializeResult, McpError> {
    let has_server_info = value
        .get("serverInfo")
        .is_some_and(|info| info.is_object());
    if !has_server_info {
        return Err(McpError::InvalidResponse(
            "initialize result is missing serverInfo".to_string(),
        ));
    }
    if !value
        .get("protocolVersion")
        .is_some_and(|version| version.is_string())
    {
        return Err(McpError::InvalidResponse(
            "initialize result is missing protocolVersion".to_string(),
        ));
    }
    if let Some(object) = value.as_object_mut() {
        let capabilities = object
            .entry("capabilities")
            .or_insert_with(|| Value::Object(Map::new()));
        if capabilities.is_null() {
            *capabilities = Value::Object(Map::new());
        }
    }
    let result = serde_json::from_value::<InitializeResult>(value)?;
    if result.protocol_version.trim().is_empty() {
        return Err(McpError::InvalidResponse(
            "initialize result is missing protocolVersion".to_string(),
        ));
    }
    Ok(result)
}

/// Minimal initialize result for servers that only answer with keep-alive frames.
pub fn synthesized_initialize_result(protocol_version: &str) -> InitializeResult {
    InitializeResult {
        capabilities: serde_json::from_value(json!({ "tools": {}, "resources": {} }))
            .unwrap_or_default(),
        instructions: None,
        meta: None,
        protocol_version: protocol_version.to_string(),
        server_info: Implementation {
            name: "unknown".to_string(),
            version: "unknown".to_string(),
            title: None,
            description: None,
            icons: Vec::new(),
            website_url: None,
        },
    }
}

pub fn parse_list_tools(value: Value) -> Result<ListToolsResult, McpError> {
    Ok(serde_json::from_value(value)?)
}

pub fn parse_list_resources(value: Value) -> Result<ListResourcesResult, McpError> {
    Ok(serde_json::from_value(value)?)
}

/// Capability flags advertised by the server at `initialize`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
    pub logging: bool,
    pub completions: bool,
}

impl From<&ServerCapabilities> for CapabilityManifest {
    fn from(capabilities: &ServerCapabilities) -> Self {
        Self {
            tools: capabilities.tools.is_some(),
            resources: capabilities.resources.is_some(),
            prompts: capabilities.prompts.is_some(),
            logging: capabilities.logging.is_some(),
            completions: capabilities.completions.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl From<&Implementation> for ServerInfo {
    fn from(implementation: &Implementation) -> Self {
        Self {
            name: implementation.name.clone(),
            version: implementation.version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl From<&Tool> for ToolDefinition {
    fn from(tool: &Tool) -> Self {
        let mut metadata = Map::new();
        if let Some(annotations) = tool.annotations.as_ref() {
            if let Ok(value) = serde_json::to_value(annotations) {
                metadata.insert("annotations".to_string(), value);
            }
        }
        if let Some(meta) = tool.meta.as_ref() {
            metadata.insert("_meta".to_string(), Value::Object(meta.clone()));
        }
        if let Some(output_schema) = tool.output_schema.as_ref() {
            if let Ok(value) = serde_json::to_value(output_schema) {
                metadata.insert("outputSchema".to_string(), value);
            }
        }
        Self {
            name: tool.name.clone(),
            title: tool.title.clone(),
            description: tool.description.clone(),
            input_schema: serde_json::to_value(&tool.input_schema)
                .unwrap_or_else(|_| json!({ "type": "object" })),
            metadata: if metadata.is_empty() {
                Value::Null
            } else {
                Value::Object(metadata)
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl From<&Resource> for ResourceDefinition {
    fn from(resource: &Resource) -> Self {
        Self {
            uri: resource.uri.clone(),
            name: resource.name.clone(),
            description: resource.description.clone(),
            mime_type: resource.mime_type.clone(),
            metadata: resource
                .meta
                .as_ref()
                .map(|meta| Value::Object(meta.clone()))
                .unwrap_or(Value::Null),
        }
    }
}

/// Tool output after content-block normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Json(Value),
    Text(String),
}

/// Normalized `tools/call` outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedToolResult {
    pub output: ToolOutput,
    pub is_error: bool,
}

/// Collapses an MCP tool result into a parsed JSON value or a plain string.
///
/// Text blocks are concatenated and parsed as JSON when possible. Results that
/// carry no text fall back to `structuredContent`, then to the serialized blocks.
/// Payloads that are not MCP tool results are passed through untouched.
pub fn normalize_tool_result(raw: Value) -> NormalizedToolResult {
    let looks_like_tool_result = raw
        .get("content")
        .is_some_and(|content| content.is_array());
    if !looks_like_tool_result {
        return NormalizedToolResult {
            output: ToolOutput::Json(raw),
            is_error: false,
        };
    }

    let parsed = match serde_json::from_value::<CallToolResult>(raw.clone()) {
        Ok(parsed) => parsed,
        Err(_) => {
            return NormalizedToolResult {
                output: normalize_text_blocks(&raw),
                is_error: raw
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            };
        }
    };

    let texts: Vec<&str> = parsed
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::TextContent(text) => Some(text.text.as_str()),
            _ => None,
        })
        .collect();

    let output = if !texts.is_empty() {
        text_output(texts.concat())
    } else if let Some(structured) = parsed.structured_content.clone() {
        ToolOutput::Json(Value::Object(structured))
    } else {
        ToolOutput::Json(raw.get("content").cloned().unwrap_or(Value::Null))
    };

    NormalizedToolResult {
        output,
        is_error: parsed.is_error.unwrap_or(false),
    }
}

fn normalize_text_blocks(raw: &Value) -> ToolOutput {
    let texts: Vec<&str> = raw
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if texts.is_empty() {
        ToolOutput::Json(raw.get("content").cloned().unwrap_or(Value::Null))
    } else {
        text_output(texts.concat())
    }
}

fn text_output(text: String) -> ToolOutput {
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => ToolOutput::Json(value),
        Err(_) => ToolOutput::Text(text),
    }
}

impl ToolOutput {
    /// Human-readable rendering, used for error messages.
    pub fn to_display_string(&self) -> String {
        match self {
            ToolOutput::Text(text) => text.clone(),
            ToolOutput::Json(Value::String(text)) => text.clone(),
            ToolOutput::Json(value) => value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_envelope_fields() {
        let request = JsonRpcRequest::new(7, METHOD_TOOLS_LIST, None);
        let value = serde_json::to_value(&request).expect("request should serialize");
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}));

        let notification = JsonRpcRequest::notification(METHOD_INITIALIZED, None);
        let value = serde_json::to_value(&notification).expect("notification should serialize");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn response_detection_ignores_requests_and_notifications() {
        assert!(JsonRpcResponse::from_value(json!({"jsonrpc": "2.0", "method": "ping", "id": 1})).is_none());
        assert!(JsonRpcResponse::from_value(json!({"jsonrpc": "2.0", "id": 1})).is_none());
        let response = JsonRpcResponse::from_value(json!({"jsonrpc": "2.0", "id": "4", "result": {}}))
            .expect("response should parse");
        assert_eq!(response.correlation_id(), Some(4));
    }

    #[test]
    fn rpc_error_becomes_protocol_error() {
        let response = JsonRpcResponse::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .expect("error response should parse");
        let err = response.into_result().expect_err("expected protocol error");
        assert!(err.is_method_not_found());
    }

    #[test]
    fn initialize_requires_server_info() {
        let ok = parse_initialize_result(json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "serverInfo": {"name": "demo", "version": "1.0"}
        }))
        .expect("initialize should parse");
        assert_eq!(ok.server_info.name, "demo");

        assert!(parse_initialize_result(json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {}
        }))
        .is_err());
    }

    #[test]
    fn initialize_without_capabilities_advertises_none() {
        let result = parse_initialize_result(json!({
            "protocolVersion": "2025-06-18",
            "serverInfo": {"name": "demo", "version": "1.0"}
        }))
        .expect("capabilities are optional");
        assert_eq!(result.protocol_version, "2025-06-18");
        assert_eq!(CapabilityManifest::from(&result.capabilities), CapabilityManifest::default());

        assert!(parse_initialize_result(json!({
            "serverInfo": {"name": "demo", "version": "1.0"}
        }))
        .is_err());
    }

    #[test]
    fn initialize_rejects_blank_protocol_version() {
        assert!(parse_initialize_result(json!({
            "protocolVersion": " ",
            "capabilities": {},
            "serverInfo": {"name": "x", "version": "1.0.0"}
        }))
        .is_err());
    }

    #[test]
    fn initialize_params_advertise_client_capabilities() {
        let params = initialize_params("2025-06-18");
        let capabilities = params.get("capabilities").expect("capabilities");
        assert!(capabilities.get("sampling").is_some());
        assert!(capabilities.get("elicitation").is_some());
        assert!(capabilities.get("roots").is_some());
        assert_eq!(params["clientInfo"]["name"], CLIENT_NAME);
    }

    #[test]
    fn requested_version_falls_back_to_latest() {
        assert_eq!(requested_protocol_version(Some(" 2025-03-26 ")), "2025-03-26");
        assert_eq!(requested_protocol_version(Some("")), LATEST_PROTOCOL_VERSION);
        assert_eq!(requested_protocol_version(None), LATEST_PROTOCOL_VERSION);
    }

    #[test]
    fn text_json_block_is_parsed() {
        let normalized = normalize_tool_result(json!({
            "content": [{"type": "text", "text": "{\"a\":1}"}]
        }));
        assert_eq!(normalized.output, ToolOutput::Json(json!({"a": 1})));
        assert!(!normalized.is_error);
    }

    #[test]
    fn non_json_text_block_stays_a_string() {
        let normalized = normalize_tool_result(json!({
            "content": [{"type": "text", "text": "not json"}]
        }));
        assert_eq!(normalized.output, ToolOutput::Text("not json".to_string()));
    }

    #[test]
    fn text_blocks_are_concatenated_before_parsing() {
        let normalized = normalize_tool_result(json!({
            "content": [
                {"type": "text", "text": "{\"items\":"},
                {"type": "text", "text": "[1,2]}"}
            ]
        }));
        assert_eq!(normalized.output, ToolOutput::Json(json!({"items": [1, 2]})));
    }

    #[test]
    fn error_flag_is_preserved() {
        let normalized = normalize_tool_result(json!({
            "content": [{"type": "text", "text": "disk full"}],
            "isError": true
        }));
        assert!(normalized.is_error);
        assert_eq!(normalized.output.to_display_string(), "disk full");
    }

    #[test]
    fn raw_results_pass_through() {
        let normalized = normalize_tool_result(json!({"answer": 42}));
        assert_eq!(normalized.output, ToolOutput::Json(json!({"answer": 42})));
    }

    #[test]
    fn batch_payload_yields_every_response() {
        let responses = responses_in(json!([
            {"jsonrpc": "2.0", "id": 1, "result": {}},
            {"jsonrpc": "2.0", "method": "notifications/progress"},
            {"jsonrpc": "2.0", "id": 2, "error": {"code": -1, "message": "x"}}
        ]));
        let ids: Vec<Option<u64>> = responses.iter().map(JsonRpcResponse::correlation_id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
    }
}
