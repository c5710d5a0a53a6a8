//! Single-shot JSON-RPC over HTTP POST.

use super::sse_parse::{
    decode_http_body, is_event_stream_content_type, HttpBody, ResponseScan, SseLineBuffer,
};
use super::{
    apply_connection_headers, apply_json_post_headers, apply_protocol_version_header,
    normalize_url, run_cancellable, CallContext, Transport, MCP_SESSION_ID_HEADER,
};
use crate::mcp::error::McpError;
use crate::mcp::protocol::{
    requested_protocol_version, synthesized_initialize_result, JsonRpcRequest, JsonRpcResponse,
    METHOD_INITIALIZE,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const ERROR_BODY_PREVIEW: usize = 512;

/// Plain HTTP carrier with streamable-HTTP session header echo.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    session_ids: Arc<Mutex<HashMap<String, String>>>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            session_ids: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn session_id(&self, url: &str) -> Option<String> {
        self.session_ids
            .lock()
            .await
            .get(&normalize_url(url))
            .cloned()
    }

    async fn post(
        &self,
        ctx: CallContext<'_>,
        payload: &JsonRpcRequest,
    ) -> Result<HttpBody, McpError> {
        let url = ctx.config.url.trim();
        let cache_key = normalize_url(url);
        let session_id = self.session_ids.lock().await.get(&cache_key).cloned();

        let mut request = apply_connection_headers(
            apply_protocol_version_header(
                apply_json_post_headers(self.client.post(url)),
                ctx.protocol_version,
            ),
            ctx.config,
        )
        .timeout(ctx.timeout)
        .json(payload);
        if let Some(session_id) = session_id.as_deref() {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }

        debug!(
            url = %url,
            method = %payload.method,
            request_id = ?payload.id,
            "Sending MCP HTTP request"
        );

        let method = payload.method.as_str();
        let after_ms = ctx.timeout_ms();
        run_cancellable(ctx.cancel, async {
            let response = request
                .send()
                .await
                .map_err(|err| map_reqwest_error(err, method, after_ms))?;
            let status = response.status();

            if let Some(issued) = response
                .headers()
                .get(MCP_SESSION_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string())
            {
                self.session_ids.lock().await.insert(cache_key.clone(), issued);
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(decode_error_body(status.as_u16(), &body));
            }
            if payload.id.is_none() {
                return Ok(HttpBody::Empty);
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_string();

            if is_event_stream_content_type(&content_type) {
                return read_event_stream(response, payload.id, method, after_ms).await;
            }

            let body = response
                .text()
                .await
                .map_err(|err| map_reqwest_error(err, method, after_ms))?;
            decode_http_body(&content_type, &body, payload.id)
        })
        .await
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

/// Reads an event-stream body only until the matching response shows up.
async fn read_event_stream(
    response: reqwest::Response,
    expected_id: Option<u64>,
    method: &str,
    after_ms: u64,
) -> Result<HttpBody, McpError> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();
    let mut scan = ResponseScan::new(expected_id);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| map_reqwest_error(err, method, after_ms))?;
        for line in buffer.push(&chunk) {
            if let Some(response) = scan.feed_line(&line) {
                return Ok(HttpBody::Message(response));
            }
        }
    }

    for line in buffer.finish() {
        if let Some(response) = scan.feed_line(&line) {
            return Ok(HttpBody::Message(response));
        }
    }

    scan.finish()
}

pub(crate) fn map_reqwest_error(err: reqwest::Error, method: &str, after_ms: u64) -> McpError {
    if err.is_timeout() {
        McpError::Timeout {
            method: method.to_string(),
            after_ms,
        }
    } else {
        McpError::from(err)
    }
}

/// Turns a non-2xx answer into the most specific error available.
///
/// Servers frequently attach a JSON-RPC error object to 4xx/5xx responses.
pub(crate) fn decode_error_body(status: u16, body: &str) -> McpError {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(response) = JsonRpcResponse::from_value(value) {
            if let Some(error) = response.error {
                return McpError::Protocol {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                };
            }
        }
    }
    let preview: String = trimmed.chars().take(ERROR_BODY_PREVIEW).collect();
    McpError::http_status(status, preview)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        ctx: CallContext<'_>,
        request: JsonRpcRequest,
    ) -> Result<Value, McpError> {
        match self.post(ctx, &request).await? {
            HttpBody::Message(response) => response.into_result(),
            HttpBody::KeepAliveOnly if request.method == METHOD_INITIALIZE => {
                let offered = request
                    .params
                    .as_ref()
                    .and_then(|params| params.get("protocolVersion"))
                    .and_then(Value::as_str);
                let version = requested_protocol_version(offered);
                warn!(
                    url = %ctx.config.url,
                    "MCP server answered initialize with keep-alives only; assuming handshake success"
                );
                Ok(serde_json::to_value(synthesized_initialize_result(&version))?)
            }
            HttpBody::KeepAliveOnly => Err(McpError::InvalidResponse(format!(
                "{} returned only keep-alive frames",
                request.method
            ))),
            HttpBody::Empty => Err(McpError::InvalidResponse(format!(
                "{} returned an empty body",
                request.method
            ))),
        }
    }

    async fn notify(
        &self,
        ctx: CallContext<'_>,
        notification: JsonRpcRequest,
    ) -> Result<(), McpError> {
        self.post(ctx, &notification).await.map(|_| ())
    }

    async fn invalidate(&self, url: &str) {
        self.session_ids.lock().await.remove(&normalize_url(url));
    }

    async fn cleanup(&self, url: &str) {
        self.invalidate(url).await;
    }

    async fn cleanup_all(&self) {
        self.session_ids.lock().await.clear();
    }
}
