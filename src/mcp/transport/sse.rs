//! SSE session transport: a long-lived GET event stream carries responses,
//! and requests are POSTed to `<base>/message?sessionId=<id>`.
//!
//! Sessions are cached per normalized URL. A background listener task per
//! session reassembles JSON-RPC messages and settles them through the
//! session's [`RequestCorrelator`].
//!
//! A 400/404 on the message endpoint discards the session and surfaces
//! [`McpError::SessionExpired`]; the client re-establishes and re-runs the
//! handshake, since a fresh session has not seen `initialize`.

use super::http::{decode_error_body, map_reqwest_error};
use super::sse_parse::{
    decode_http_body, extract_session_id, is_event_stream_content_type, is_keep_alive_line,
    sse_data_payload, sse_event_name, HttpBody, SseLineBuffer, SseMessageAssembler,
};
use super::{
    apply_connection_headers, apply_json_post_headers, apply_protocol_version_header,
    normalize_url, run_cancellable, sse_message_url, CallContext, Transport, TransportKind,
    MCP_EVENT_STREAM_ACCEPT,
};
use crate::mcp::correlator::RequestCorrelator;
use crate::mcp::error::McpError;
use crate::mcp::protocol::{responses_in, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

const CONNECT_METHOD: &str = "sse/connect";

/// Public view of an active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub established_at: DateTime<Utc>,
    pub message_url: String,
}

struct SseSession {
    info: SessionInfo,
    correlator: RequestCorrelator,
    closed: Arc<AtomicBool>,
    listener: AbortHandle,
}

impl SseSession {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self, reason: &str) {
        self.closed.store(true, Ordering::Release);
        self.listener.abort();
        let rejected = self
            .correlator
            .reject_all(McpError::Closed(reason.to_string()))
            .await;
        debug!(
            session_id = %self.info.session_id,
            rejected,
            reason,
            "Closed MCP SSE session"
        );
    }
}

impl Drop for SseSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

struct AbortOnDrop(Option<AbortHandle>);

impl AbortOnDrop {
    fn disarm(mut self) -> Option<AbortHandle> {
        self.0.take()
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Session manager and carrier for SSE-based MCP servers.
#[derive(Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    sessions: Arc<Mutex<HashMap<String, Arc<SseSession>>>>,
    // Per-URL locks so concurrent callers share one session without one slow
    // server holding up the others.
    establishing: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SseTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            establishing: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn session_info(&self, url: &str) -> Option<SessionInfo> {
        self.sessions
            .lock()
            .await
            .get(&normalize_url(url))
            .filter(|session| session.is_open())
            .map(|session| session.info.clone())
    }

    async fn cached_session(&self, key: &str) -> Option<Arc<SseSession>> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(key) {
            Some(session) if session.is_open() => Some(Arc::clone(session)),
            Some(_) => {
                sessions.remove(key);
                None
            }
            None => None,
        }
    }

    async fn establishment_lock(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.establishing
                .lock()
                .await
                .entry(key.to_string())
                .or_default(),
        )
    }

    async fn ensure_session(&self, ctx: CallContext<'_>) -> Result<Arc<SseSession>, McpError> {
        let key = normalize_url(&ctx.config.url);
        if let Some(session) = self.cached_session(&key).await {
            return Ok(session);
        }

        let lock = self.establishment_lock(&key).await;
        let _establishing = lock.lock().await;
        if let Some(session) = self.cached_session(&key).await {
            return Ok(session);
        }

        let session = Arc::new(self.establish(ctx).await?);
        self.sessions
            .lock()
            .await
            .insert(key, Arc::clone(&session));
        Ok(session)
    }

    async fn establish(&self, ctx: CallContext<'_>) -> Result<SseSession, McpError> {
        let url = ctx.config.url.trim();
        let after_ms = ctx.timeout_ms();
        let timed_out = || McpError::Timeout {
            method: CONNECT_METHOD.to_string(),
            after_ms,
        };

        debug!(url = %url, "Opening MCP SSE stream");
        let request = apply_connection_headers(
            self.client
                .get(url)
                .header("Accept", MCP_EVENT_STREAM_ACCEPT),
            ctx.config,
        );
        let response = tokio::time::timeout(ctx.timeout, request.send())
            .await
            .map_err(|_| timed_out())?
            .map_err(|err| map_reqwest_error(err, CONNECT_METHOD, after_ms))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(decode_error_body(status.as_u16(), &body));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !is_event_stream_content_type(&content_type) {
            return Err(McpError::transport(format!(
                "Expected text/event-stream from {url}, got {}",
                if content_type.is_empty() {
                    "no content type"
                } else {
                    content_type.as_str()
                }
            )));
        }

        let correlator = RequestCorrelator::new();
        let closed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let listener = SseListener {
            url: url.to_string(),
            ready: Some(ready_tx),
            assembler: SseMessageAssembler::default(),
            correlator: correlator.clone(),
            closed: Arc::clone(&closed),
        };
        let guard = AbortOnDrop(Some(
            tokio::spawn(listener.run(response)).abort_handle(),
        ));

        let session_id = match tokio::time::timeout(ctx.timeout, ready_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(McpError::Closed(
                    "SSE listener stopped during handshake".to_string(),
                ))
            }
            Err(_) => return Err(timed_out()),
        };

        let Some(listener) = guard.disarm() else {
            return Err(McpError::Closed("SSE listener missing".to_string()));
        };
        let message_url = sse_message_url(url, &session_id);
        info!(url = %url, session_id = %session_id, "MCP SSE session established");

        Ok(SseSession {
            info: SessionInfo {
                session_id,
                established_at: Utc::now(),
                message_url,
            },
            correlator,
            closed,
            listener,
        })
    }

    /// Drops the cached session for `key` if it is still `session`.
    async fn discard(&self, key: &str, session: &Arc<SseSession>, reason: &str) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(key) {
                Some(current) if Arc::ptr_eq(current, session) => sessions.remove(key),
                _ => None,
            }
        };
        if removed.is_some() {
            session.close(reason).await;
        }
    }

    async fn post_message(
        &self,
        ctx: CallContext<'_>,
        session: &SseSession,
        message: &JsonRpcRequest,
    ) -> Result<Option<JsonRpcResponse>, McpError> {
        let method = message.method.as_str();
        let after_ms = ctx.timeout_ms();
        let request = apply_connection_headers(
            apply_protocol_version_header(
                apply_json_post_headers(self.client.post(&session.info.message_url)),
                ctx.protocol_version,
            ),
            ctx.config,
        )
        .timeout(ctx.timeout)
        .json(message);

        debug!(
            url = %session.info.message_url,
            method,
            request_id = ?message.id,
            "Posting MCP SSE message"
        );
        let response = request
            .send()
            .await
            .map_err(|err| map_reqwest_error(err, method, after_ms))?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match (status.as_u16(), decode_error_body(status.as_u16(), &body)) {
                (_, protocol @ McpError::Protocol { .. }) => protocol,
                (code @ (400 | 404), _) => McpError::SessionExpired { status: code },
                (_, other) => other,
            });
        }

        if message.id.is_none() {
            return Ok(None);
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.unwrap_or_default();
        // Most servers answer "Accepted" here; only a JSON-RPC body settles early.
        match decode_http_body(&content_type, &body, message.id) {
            Ok(HttpBody::Message(response)) if response.correlation_id() == message.id => {
                Ok(Some(response))
            }
            _ => Ok(None),
        }
    }

    /// One request on one session: register, POST, await the stream.
    async fn dispatch(
        &self,
        ctx: CallContext<'_>,
        session: &SseSession,
        request: &JsonRpcRequest,
        id: u64,
    ) -> Result<Value, McpError> {
        let correlator = &session.correlator;
        let pending = correlator.register(id, &request.method, ctx.timeout).await;

        let exchange = async {
            match self.post_message(ctx, session, request).await {
                Ok(Some(response)) => {
                    match response.into_result() {
                        Ok(value) => correlator.resolve(id, value).await,
                        Err(err) => correlator.reject(id, err).await,
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    correlator.reject(id, err).await;
                }
            }
            pending.wait().await
        };

        match ctx.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        correlator.cancel(id).await;
                        Err(McpError::Aborted)
                    }
                    result = exchange => result,
                }
            }
            None => exchange.await,
        }
    }
}

impl Default for SseTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(
        &self,
        ctx: CallContext<'_>,
        request: JsonRpcRequest,
    ) -> Result<Value, McpError> {
        let Some(id) = request.id else {
            return Err(McpError::Config(format!(
                "{} sent as a request without an id",
                request.method
            )));
        };
        let key = normalize_url(&ctx.config.url);

        let session = run_cancellable(ctx.cancel, self.ensure_session(ctx)).await?;
        match self.dispatch(ctx, &session, &request, id).await {
            Err(err @ McpError::SessionExpired { .. }) => {
                info!(
                    url = %ctx.config.url,
                    session_id = %session.info.session_id,
                    error = %err,
                    "MCP SSE session expired"
                );
                self.discard(&key, &session, "session expired").await;
                Err(err)
            }
            other => other,
        }
    }

    async fn notify(
        &self,
        ctx: CallContext<'_>,
        notification: JsonRpcRequest,
    ) -> Result<(), McpError> {
        let session = run_cancellable(ctx.cancel, self.ensure_session(ctx)).await?;
        run_cancellable(ctx.cancel, self.post_message(ctx, &session, &notification))
            .await
            .map(|_| ())
    }

    async fn invalidate(&self, url: &str) {
        let removed = self.sessions.lock().await.remove(&normalize_url(url));
        if let Some(session) = removed {
            session.close("session invalidated").await;
        }
    }

    async fn cleanup(&self, url: &str) {
        let removed = self.sessions.lock().await.remove(&normalize_url(url));
        if let Some(session) = removed {
            session.close("client cleanup").await;
        }
    }

    async fn cleanup_all(&self) {
        let drained: Vec<Arc<SseSession>> = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in drained {
            session.close("client cleanup").await;
        }
    }
}

/// Background reader for one event stream.
struct SseListener {
    url: String,
    ready: Option<oneshot::Sender<Result<String, McpError>>>,
    assembler: SseMessageAssembler,
    correlator: RequestCorrelator,
    closed: Arc<AtomicBool>,
}

impl SseListener {
    async fn run(mut self, response: reqwest::Response) {
        let mut stream = response.bytes_stream();
        let mut buffer = SseLineBuffer::default();

        'read: while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(url = %self.url, error = %err, "MCP SSE stream read failed");
                    break;
                }
            };
            for line in buffer.push(&chunk) {
                if !self.handle_line(&line).await {
                    break 'read;
                }
            }
        }
        for line in buffer.finish() {
            if !self.handle_line(&line).await {
                break;
            }
        }

        self.closed.store(true, Ordering::Release);
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(McpError::transport(
                "SSE stream ended before a session id was issued",
            )));
        }
        let rejected = self
            .correlator
            .reject_all(McpError::Closed("SSE stream ended".to_string()))
            .await;
        info!(url = %self.url, rejected, "MCP SSE stream closed");
    }

    /// Returns false when the listener should stop.
    async fn handle_line(&mut self, line: &str) -> bool {
        if self.ready.is_some() {
            if let Some(session_id) = handshake_session_id(line) {
                if let Some(ready) = self.ready.take() {
                    // A dropped receiver means the caller gave up on the handshake.
                    return ready.send(Ok(session_id)).is_ok();
                }
            }
            if sse_event_name(line).is_some() || is_keep_alive_line(line) {
                return true;
            }
        }

        for value in self.assembler.feed_line(line) {
            self.dispatch(value).await;
        }
        true
    }

    async fn dispatch(&self, value: Value) {
        if let Some(method) = value.get("method").and_then(Value::as_str) {
            debug!(url = %self.url, method, "Ignoring server-initiated MCP message");
            return;
        }
        for response in responses_in(value) {
            let Some(id) = response.correlation_id() else {
                debug!(url = %self.url, "Dropping MCP response without a usable id");
                continue;
            };
            let settled = match response.into_result() {
                Ok(result) => self.correlator.resolve(id, result).await,
                Err(err) => self.correlator.reject(id, err).await,
            };
            if !settled {
                debug!(url = %self.url, request_id = id, "No pending request for SSE response");
            }
        }
    }
}

/// Session token from a handshake line, if it carries one.
fn handshake_session_id(line: &str) -> Option<String> {
    if is_keep_alive_line(line) {
        return None;
    }
    sse_data_payload(line).and_then(extract_session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_accepts_both_data_formats() {
        assert_eq!(
            handshake_session_id("data: /message?sessionId=abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(
            handshake_session_id("data: sessionId: s-9"),
            Some("s-9".to_string())
        );
        assert_eq!(handshake_session_id("event: endpoint"), None);
        assert_eq!(handshake_session_id(": ping - sessionId=nope"), None);
    }

    #[tokio::test]
    async fn listener_settles_reassembled_responses() {
        let correlator = RequestCorrelator::new();
        let pending = correlator
            .register(4, "tools/list", std::time::Duration::from_secs(5))
            .await;
        let mut listener = SseListener {
            url: "http://localhost/sse".to_string(),
            ready: None,
            assembler: SseMessageAssembler::default(),
            correlator: correlator.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        };

        for line in [
            "event: message",
            r#"data: {"jsonrpc":"2.0","#,
            r#"data: "id":4,"result":{"tools":[]}}"#,
        ] {
            assert!(listener.handle_line(line).await);
        }

        let value = pending.wait().await.expect("settled");
        assert_eq!(value, serde_json::json!({"tools": []}));
    }

    #[tokio::test]
    async fn listener_ignores_unknown_ids_and_server_requests() {
        let correlator = RequestCorrelator::new();
        let pending = correlator
            .register(1, "initialize", std::time::Duration::from_secs(5))
            .await;
        let mut listener = SseListener {
            url: "http://localhost/sse".to_string(),
            ready: None,
            assembler: SseMessageAssembler::default(),
            correlator: correlator.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        };

        listener
            .handle_line(r#"data: {"jsonrpc":"2.0","id":99,"result":{}}"#)
            .await;
        listener
            .handle_line(r#"data: {"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .await;
        assert_eq!(correlator.pending_count().await, 1);

        listener
            .handle_line(r#"data: {"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"nope"}}"#)
            .await;
        assert!(matches!(
            pending.wait().await,
            Err(McpError::Protocol { code: -32000, .. })
        ));
    }
}
