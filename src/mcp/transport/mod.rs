//! Wire transports and the rules for choosing between them.
//!
//! Every transport takes a [`JsonRpcRequest`] and hands back the settled
//! JSON-RPC `result` (or a typed [`McpError`]), so the client orchestrator can
//! stay carrier-agnostic.

use crate::core::config::{AuthConfig, ConnectionConfig, TransportPreference};
use crate::mcp::error::McpError;
use crate::mcp::protocol::JsonRpcRequest;
use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub mod http;
pub mod sse;
pub mod sse_parse;
pub mod websocket;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_EVENT_STREAM_ACCEPT: &str = "text/event-stream";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Concrete carrier used for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Http,
    Sse,
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Http => f.write_str("http"),
            TransportKind::Sse => f.write_str("sse"),
            TransportKind::WebSocket => f.write_str("websocket"),
        }
    }
}

/// Resolves the carrier for a connection: explicit preference first, then the URL.
pub fn select_transport(config: &ConnectionConfig) -> Result<TransportKind, McpError> {
    let url = parse_connection_url(&config.url)?;
    match config.transport {
        TransportPreference::Http => Ok(TransportKind::Http),
        TransportPreference::Sse => Ok(TransportKind::Sse),
        TransportPreference::WebSocket => Ok(TransportKind::WebSocket),
        TransportPreference::Auto => Ok(detect_transport(&url)),
    }
}

fn detect_transport(url: &Url) -> TransportKind {
    match url.scheme() {
        "ws" | "wss" => TransportKind::WebSocket,
        _ if url.path().to_ascii_lowercase().contains("/sse") => TransportKind::Sse,
        _ => TransportKind::Http,
    }
}

pub fn parse_connection_url(raw: &str) -> Result<Url, McpError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(McpError::Config("MCP server URL is required.".to_string()));
    }
    let url = Url::parse(trimmed)
        .map_err(|err| McpError::Config(format!("Invalid MCP server URL {trimmed}: {err}")))?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(url),
        other => Err(McpError::Config(format!(
            "Unsupported MCP URL scheme: {other}"
        ))),
    }
}

/// Whether the URL suggests an SSE-only endpoint worth a fallback attempt.
pub fn url_hints_sse(url: &str) -> bool {
    url.to_ascii_lowercase().contains("sse")
}

/// Cache key for a connection URL.
///
/// Whitespace and trailing slashes are dropped; scheme and host are lowercased.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    match Url::parse(trimmed) {
        Ok(parsed) => parsed.as_str().trim_end_matches('/').to_string(),
        Err(_) => trimmed.to_string(),
    }
}

/// Base URL for SSE message POSTs: the stream URL without a trailing `/sse` segment.
pub fn sse_message_base(url: &str) -> String {
    let normalized = normalize_url(url);
    let (without_query, _) = normalized
        .split_once('?')
        .unwrap_or((normalized.as_str(), ""));
    let trimmed = without_query.trim_end_matches('/');
    match trimmed.strip_suffix("/sse") {
        Some(base) => base.to_string(),
        None => trimmed.to_string(),
    }
}

pub fn sse_message_url(url: &str, session_id: &str) -> String {
    let mut message_url = format!("{}/message", sse_message_base(url));
    message_url.push_str("?sessionId=");
    message_url.extend(url::form_urlencoded::byte_serialize(session_id.as_bytes()));
    message_url
}

/// Header pairs derived from the connection's credentials and static headers.
pub fn connection_headers(config: &ConnectionConfig) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = config
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    match &config.auth {
        AuthConfig::None => {}
        AuthConfig::Bearer { token } => {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token.trim())));
        }
        AuthConfig::ApiKey { key } => {
            headers.push((API_KEY_HEADER.to_string(), key.trim().to_string()));
        }
        AuthConfig::Basic { username, password } => {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));
            headers.push(("Authorization".to_string(), format!("Basic {encoded}")));
        }
    }

    headers
}

pub fn apply_connection_headers(
    mut request: reqwest::RequestBuilder,
    config: &ConnectionConfig,
) -> reqwest::RequestBuilder {
    for (name, value) in connection_headers(config) {
        request = request.header(name, value);
    }
    request
}

pub fn apply_json_post_headers(request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    request
        .header("Content-Type", MCP_JSON_CONTENT_TYPE)
        .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
}

pub fn apply_protocol_version_header(
    request: reqwest::RequestBuilder,
    protocol_version: Option<&str>,
) -> reqwest::RequestBuilder {
    match protocol_version {
        Some(protocol_version) if !protocol_version.trim().is_empty() => {
            request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version)
        }
        _ => request,
    }
}

/// Per-call inputs shared by every transport.
#[derive(Clone, Copy)]
pub struct CallContext<'a> {
    pub config: &'a ConnectionConfig,
    pub timeout: Duration,
    pub cancel: Option<&'a CancellationToken>,
    /// Negotiated version, sent as a header once known.
    pub protocol_version: Option<&'a str>,
}

impl<'a> CallContext<'a> {
    pub fn new(config: &'a ConnectionConfig) -> Self {
        Self {
            config,
            timeout: config.timeout(),
            cancel: None,
            protocol_version: None,
        }
    }

    pub fn with_cancel(mut self, cancel: Option<&'a CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_protocol_version(mut self, protocol_version: Option<&'a str>) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Races `operation` against the caller's cancellation token.
pub async fn run_cancellable<F, T>(
    cancel: Option<&CancellationToken>,
    operation: F,
) -> Result<T, McpError>
where
    F: std::future::Future<Output = Result<T, McpError>>,
{
    if let Some(token) = cancel {
        if token.is_cancelled() {
            return Err(McpError::Aborted);
        }
        tokio::select! {
            _ = token.cancelled() => Err(McpError::Aborted),
            result = operation => result,
        }
    } else {
        operation.await
    }
}

/// Carrier contract used by the client orchestrator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and waits for the matching response's `result`.
    async fn request(&self, ctx: CallContext<'_>, request: JsonRpcRequest)
        -> Result<Value, McpError>;

    /// Sends a notification; no response is awaited.
    async fn notify(&self, ctx: CallContext<'_>, notification: JsonRpcRequest)
        -> Result<(), McpError>;

    /// Drops cached session state for `url` without failing in-flight calls.
    async fn invalidate(&self, url: &str);

    /// Tears down session state for `url`, failing in-flight calls.
    async fn cleanup(&self, url: &str);

    async fn cleanup_all(&self);
}
