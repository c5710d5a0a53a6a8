//! Protocol client: handshake, capability-gated introspection, tool calls,
//! and resource reads on top of the HTTP, SSE, and WebSocket carriers.

use crate::core::config::{ConnectionConfig, TransportPreference};
use crate::mcp::error::McpError;
use crate::mcp::protocol::{
    call_tool_params, initialize_params, list_params, normalize_tool_result,
    parse_initialize_result, parse_list_resources, parse_list_tools, read_resource_params,
    requested_protocol_version, CapabilityManifest, JsonRpcRequest, ResourceDefinition,
    ServerInfo, ToolDefinition, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_RESOURCES_LIST,
    METHOD_RESOURCES_READ, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use crate::mcp::retry::{RetryPolicy, RetrySettings};
use crate::mcp::transport::http::HttpTransport;
use crate::mcp::transport::sse::{SessionInfo, SseTransport};
use crate::mcp::transport::websocket::WebSocketTransport;
use crate::mcp::transport::{
    normalize_url, run_cancellable, select_transport, url_hints_sse, CallContext, Transport,
    TransportKind,
};
use rust_mcp_schema::{InitializeResult, Tool};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod execution;

pub use execution::{ExecutionStatus, ToolExecutionRecord};

const MCP_MAX_TOOL_LIST: usize = 100;
const MCP_MAX_RESOURCE_PAGES: usize = 20;
const MCP_HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

fn build_mcp_http_client() -> Result<reqwest::Client, McpError> {
    // No overall timeout: SSE streams stay open for the life of a session.
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(MCP_HTTP_CONNECT_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .user_agent(concat!("mcpeek/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| McpError::Config(format!("Failed to build HTTP client: {err}")))
}

/// Result of [`McpClient::connect_and_introspect`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntrospectionReport {
    pub is_connected: bool,
    pub server_info: ServerInfo,
    pub protocol_version: String,
    pub capabilities: CapabilityManifest,
    pub tools: Vec<ToolDefinition>,
    pub resources: Vec<ResourceDefinition>,
    /// Non-fatal problems, such as a failed `tools/list`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// MCP protocol client shared by every connection in the process.
///
/// Request ids come from one counter per client, so they are unique and
/// increasing across all connections it serves.
#[derive(Clone)]
pub struct McpClient {
    http: HttpTransport,
    sse: SseTransport,
    websocket: WebSocketTransport,
    retry: RetrySettings,
    next_id: Arc<AtomicU64>,
    negotiated: Arc<Mutex<HashMap<String, String>>>,
    fallbacks: Arc<Mutex<HashMap<String, TransportKind>>>,
}

impl McpClient {
    pub fn new() -> Result<Self, McpError> {
        Ok(Self::with_http_client(build_mcp_http_client()?))
    }

    pub fn with_http_client(client: reqwest::Client) -> Self {
        Self {
            http: HttpTransport::new(client.clone()),
            sse: SseTransport::new(client),
            websocket: WebSocketTransport::new(),
            retry: RetrySettings::default(),
            next_id: Arc::new(AtomicU64::new(0)),
            negotiated: Arc::new(Mutex::new(HashMap::new())),
            fallbacks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_retry_settings(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn transport(&self, kind: TransportKind) -> &dyn Transport {
        match kind {
            TransportKind::Http => &self.http,
            TransportKind::Sse => &self.sse,
            TransportKind::WebSocket => &self.websocket,
        }
    }

    fn connection_policy(&self, config: &ConnectionConfig) -> RetryPolicy {
        let policy = RetryPolicy::for_connection(config.retry_attempts);
        match self.retry.connection.as_ref() {
            Some(backoff) => backoff.apply(policy),
            None => policy,
        }
    }

    fn tool_policy(&self, config: &ConnectionConfig) -> RetryPolicy {
        let policy = RetryPolicy::for_tool_call(config.retry_attempts);
        match self.retry.tool_call.as_ref() {
            Some(backoff) => backoff.apply(policy),
            None => policy,
        }
    }

    /// Carrier for `config`, honoring an earlier HTTP to SSE fallback.
    pub async fn resolve_transport(
        &self,
        config: &ConnectionConfig,
    ) -> Result<TransportKind, McpError> {
        let selected = select_transport(config)?;
        let remembered = self
            .fallbacks
            .lock()
            .await
            .get(&normalize_url(&config.url))
            .copied();
        Ok(remembered.unwrap_or(selected))
    }

    /// Active SSE session for `url`, if one is cached.
    pub async fn sse_session(&self, url: &str) -> Option<SessionInfo> {
        self.sse.session_info(url).await
    }

    async fn negotiated_version(&self, config: &ConnectionConfig) -> Option<String> {
        self.negotiated
            .lock()
            .await
            .get(&normalize_url(&config.url))
            .cloned()
    }

    async fn send_on(
        &self,
        kind: TransportKind,
        config: &ConnectionConfig,
        request: JsonRpcRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        let version = if request.method == METHOD_INITIALIZE {
            Some(requested_protocol_version(config.protocol_version.as_deref()))
        } else {
            self.negotiated_version(config).await
        };
        let ctx = CallContext::new(config)
            .with_cancel(cancel)
            .with_protocol_version(version.as_deref());
        debug!(
            url = %config.url,
            transport = %kind,
            method = %request.method,
            request_id = ?request.id,
            "Dispatching MCP request"
        );
        self.transport(kind).request(ctx, request).await
    }

    /// Sends one request; an expired SSE session is re-established and
    /// re-initialized once before the request is sent again.
    async fn call(
        &self,
        config: &ConnectionConfig,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        match self.call_once(config, method, params.clone(), cancel).await {
            Err(err @ McpError::SessionExpired { .. }) if method != METHOD_INITIALIZE => {
                info!(
                    url = %config.url,
                    method,
                    error = %err,
                    "Re-establishing expired MCP session"
                );
                self.negotiated
                    .lock()
                    .await
                    .remove(&normalize_url(&config.url));
                self.handshake(config, cancel, true).await?;
                self.call_once(config, method, params, cancel).await
            }
            other => other,
        }
    }

    /// Sends one request, falling back from HTTP to SSE once when the URL hints at SSE.
    async fn call_once(
        &self,
        config: &ConnectionConfig,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        let kind = self.resolve_transport(config).await?;
        let request = JsonRpcRequest::new(self.next_request_id(), method, params);
        let retry_request = request.clone();

        match self.send_on(kind, config, request, cancel).await {
            Err(err) if kind == TransportKind::Http && should_fall_back(config, &err) => {
                warn!(
                    url = %config.url,
                    method,
                    error = %err,
                    "MCP HTTP request failed; falling back to SSE"
                );
                self.fallbacks
                    .lock()
                    .await
                    .insert(normalize_url(&config.url), TransportKind::Sse);
                let request = JsonRpcRequest {
                    id: Some(self.next_request_id()),
                    ..retry_request
                };
                self.send_on(TransportKind::Sse, config, request, cancel)
                    .await
            }
            other => other,
        }
    }

    async fn notify(
        &self,
        config: &ConnectionConfig,
        method: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), McpError> {
        let kind = self.resolve_transport(config).await?;
        let version = self.negotiated_version(config).await;
        let ctx = CallContext::new(config)
            .with_cancel(cancel)
            .with_protocol_version(version.as_deref());
        self.transport(kind)
            .notify(ctx, JsonRpcRequest::notification(method, None))
            .await
    }

    async fn handshake(
        &self,
        config: &ConnectionConfig,
        cancel: Option<&CancellationToken>,
        announce: bool,
    ) -> Result<InitializeResult, McpError> {
        let version = requested_protocol_version(config.protocol_version.as_deref());
        let value = self
            .call_once(
                config,
                METHOD_INITIALIZE,
                Some(initialize_params(&version)),
                cancel,
            )
            .await?;
        let initialize = parse_initialize_result(value)?;
        self.negotiated.lock().await.insert(
            normalize_url(&config.url),
            initialize.protocol_version.clone(),
        );
        info!(
            url = %config.url,
            server = %initialize.server_info.name,
            protocol_version = %initialize.protocol_version,
            "MCP handshake complete"
        );

        if announce {
            if let Err(err) = self.notify(config, METHOD_INITIALIZED, cancel).await {
                if err.is_abort() {
                    return Err(err);
                }
                warn!(url = %config.url, error = %err, "MCP initialized notification failed");
            }
        }
        Ok(initialize)
    }

    /// Runs the handshake unless this connection already negotiated a version.
    async fn ensure_initialized(
        &self,
        config: &ConnectionConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), McpError> {
        if self.resolve_transport(config).await? == TransportKind::WebSocket {
            return Ok(());
        }
        if self.negotiated_version(config).await.is_some() {
            return Ok(());
        }
        self.handshake(config, cancel, true).await.map(|_| ())
    }

    pub async fn test_connection(&self, config: &ConnectionConfig) -> bool {
        self.test_connection_with_cancel(config, None).await
    }

    /// Cold `initialize` probe; true iff the server reports a protocol version and server info.
    pub async fn test_connection_with_cancel(
        &self,
        config: &ConnectionConfig,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        self.invalidate(&config.url).await;
        match self.handshake(config, cancel, false).await {
            Ok(_) => true,
            Err(err) => {
                debug!(url = %config.url, error = %err, "MCP connection test failed");
                false
            }
        }
    }

    pub async fn connect_and_introspect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<IntrospectionReport, McpError> {
        self.connect_and_introspect_with_cancel(config, None).await
    }

    /// Handshake plus tool and resource listing, retried as a whole.
    ///
    /// List failures are downgraded to empty lists with a warning; only a
    /// failed `initialize` fails the connection.
    pub async fn connect_and_introspect_with_cancel(
        &self,
        config: &ConnectionConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<IntrospectionReport, McpError> {
        let policy = self.connection_policy(config);
        let mut attempt = 0;
        loop {
            let err = match self.introspect_once(config, cancel).await {
                Ok(report) => return Ok(report),
                Err(err) => err,
            };
            if err.is_abort() || !err.is_retryable() || !policy.has_attempts_left(attempt) {
                warn!(
                    url = %config.url,
                    attempt = attempt + 1,
                    error = %err,
                    "MCP connection failed"
                );
                return Err(err);
            }

            let delay = policy.delay(attempt);
            warn!(
                url = %config.url,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "MCP connection attempt failed; retrying"
            );
            self.invalidate(&config.url).await;
            backoff_sleep(delay, cancel).await?;
            attempt += 1;
        }
    }

    async fn introspect_once(
        &self,
        config: &ConnectionConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<IntrospectionReport, McpError> {
        let initialize = self.handshake(config, cancel, true).await?;
        let capabilities = CapabilityManifest::from(&initialize.capabilities);
        let mut warnings = Vec::new();

        let tools = if capabilities.tools {
            match self.list_tools(config, cancel).await {
                Ok(tools) => tools,
                Err(err) if err.is_abort() => return Err(err),
                Err(err) => {
                    warn!(url = %config.url, error = %err, "MCP tools/list failed; continuing without tools");
                    warnings.push(format!("{METHOD_TOOLS_LIST} failed: {err}"));
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let resources = if capabilities.resources {
            match self.list_resources(config, cancel).await {
                Ok(resources) => resources,
                Err(err) if err.is_abort() => return Err(err),
                Err(err) => {
                    warn!(url = %config.url, error = %err, "MCP resources/list failed; continuing without resources");
                    warnings.push(format!("{METHOD_RESOURCES_LIST} failed: {err}"));
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(IntrospectionReport {
            is_connected: true,
            server_info: ServerInfo::from(&initialize.server_info),
            protocol_version: initialize.protocol_version,
            capabilities,
            tools,
            resources,
            warnings,
        })
    }

    async fn list_tools(
        &self,
        config: &ConnectionConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<ToolDefinition>, McpError> {
        let tools = paginate_tools(move |cursor: Option<String>| async move {
            let value = self
                .call(config, METHOD_TOOLS_LIST, list_params(cursor.as_deref()), cancel)
                .await?;
            let page = parse_list_tools(value)?;
            Ok::<_, McpError>((page.tools, page.next_cursor))
        })
        .await?;
        Ok(tools.iter().map(ToolDefinition::from).collect())
    }

    async fn list_resources(
        &self,
        config: &ConnectionConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<ResourceDefinition>, McpError> {
        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MCP_MAX_RESOURCE_PAGES {
            let value = self
                .call(
                    config,
                    METHOD_RESOURCES_LIST,
                    list_params(cursor.as_deref()),
                    cancel,
                )
                .await?;
            let page = parse_list_resources(value)?;
            resources.extend(page.resources.iter().map(ResourceDefinition::from));
            match page.next_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(resources)
    }

    pub async fn execute_tool(
        &self,
        config: &ConnectionConfig,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> ToolExecutionRecord {
        self.execute_tool_with_cancel(config, tool_name, arguments, None)
            .await
    }

    /// Runs `tools/call` under the tool retry profile; always returns a finished record.
    pub async fn execute_tool_with_cancel(
        &self,
        config: &ConnectionConfig,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
        cancel: Option<&CancellationToken>,
    ) -> ToolExecutionRecord {
        let request_args = arguments
            .clone()
            .map(Value::Object)
            .unwrap_or(Value::Null);
        let record = ToolExecutionRecord::pending(tool_name, request_args);
        let policy = self.tool_policy(config);

        let mut attempt = 0;
        let outcome = loop {
            let err = match self
                .call_tool_once(config, tool_name, arguments.clone(), cancel)
                .await
            {
                Ok(raw) => break Ok(raw),
                Err(err) => err,
            };
            if err.is_abort() {
                break Err(err);
            }
            if err.indicates_stale_session() {
                debug!(url = %config.url, error = %err, "Dropping stale MCP session state");
                self.invalidate(&config.url).await;
            }
            if !err.is_retryable() || !policy.has_attempts_left(attempt) {
                break Err(err);
            }

            let delay = policy.delay(attempt);
            warn!(
                url = %config.url,
                tool = tool_name,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "MCP tool call failed; retrying"
            );
            if let Err(err) = backoff_sleep(delay, cancel).await {
                break Err(err);
            }
            attempt += 1;
        };

        match outcome {
            Ok(raw) => {
                let normalized = normalize_tool_result(raw);
                if normalized.is_error {
                    record.fail(normalized.output.to_display_string())
                } else {
                    record.succeed(normalized.output)
                }
            }
            Err(err) => record.fail(err.to_string()),
        }
    }

    async fn call_tool_once(
        &self,
        config: &ConnectionConfig,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        let params = call_tool_params(tool_name, arguments)?;
        self.ensure_initialized(config, cancel).await?;
        self.call(config, METHOD_TOOLS_CALL, Some(params), cancel)
            .await
    }

    pub async fn read_resource(
        &self,
        config: &ConnectionConfig,
        uri: &str,
    ) -> Result<Value, McpError> {
        self.read_resource_with_cancel(config, uri, None).await
    }

    /// Single `resources/read`; never retried so missing resources surface directly.
    pub async fn read_resource_with_cancel(
        &self,
        config: &ConnectionConfig,
        uri: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        let params = read_resource_params(uri)?;
        self.ensure_initialized(config, cancel).await?;
        self.call(config, METHOD_RESOURCES_READ, Some(params), cancel)
            .await
    }

    /// Purges cached sessions, negotiated versions, and fallback decisions for `url`.
    pub async fn invalidate(&self, url: &str) {
        let key = normalize_url(url);
        self.negotiated.lock().await.remove(&key);
        self.fallbacks.lock().await.remove(&key);
        self.http.invalidate(url).await;
        self.sse.invalidate(url).await;
        self.websocket.invalidate(url).await;
    }

    /// Closes sessions for `url`, failing any requests still waiting on them.
    pub async fn cleanup(&self, url: &str) {
        let key = normalize_url(url);
        self.negotiated.lock().await.remove(&key);
        self.fallbacks.lock().await.remove(&key);
        self.http.cleanup(url).await;
        self.sse.cleanup(url).await;
        self.websocket.cleanup(url).await;
    }

    pub async fn cleanup_all(&self) {
        self.negotiated.lock().await.clear();
        self.fallbacks.lock().await.clear();
        self.http.cleanup_all().await;
        self.sse.cleanup_all().await;
        self.websocket.cleanup_all().await;
    }
}

fn should_fall_back(config: &ConnectionConfig, err: &McpError) -> bool {
    config.transport == TransportPreference::Auto
        && url_hints_sse(&config.url)
        && matches!(
            err,
            McpError::Transport { .. } | McpError::InvalidResponse(_)
        )
}

async fn backoff_sleep(delay: Duration, cancel: Option<&CancellationToken>) -> Result<(), McpError> {
    run_cancellable(cancel, async {
        tokio::time::sleep(delay).await;
        Ok(())
    })
    .await
}

/// Follows `nextCursor` until the listing ends or [`MCP_MAX_TOOL_LIST`] tools are collected.
async fn paginate_tools<F, Fut>(mut fetch_page: F) -> Result<Vec<Tool>, McpError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(Vec<Tool>, Option<String>), McpError>>,
{
    let (mut tools, mut next_cursor) = fetch_page(None).await?;
    while tools.len() < MCP_MAX_TOOL_LIST {
        let Some(cursor) = next_cursor.take() else {
            break;
        };
        let (page, cursor_after) = fetch_page(Some(cursor.clone())).await?;
        let empty_page = page.is_empty();
        tools.extend(page);
        next_cursor = cursor_after.filter(|next| *next != cursor);
        if empty_page {
            break;
        }
    }
    tools.truncate(MCP_MAX_TOOL_LIST);
    Ok(tools)
}
