//! WebSocket carrier: one socket per request, correlated by the response id.

use super::{connection_headers, run_cancellable, CallContext, Transport};
use crate::mcp::error::McpError;
use crate::mcp::protocol::{responses_in, JsonRpcRequest};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }

    async fn open(&self, ctx: CallContext<'_>) -> Result<Socket, McpError> {
        let url = ctx.config.url.trim();
        let mut request = url
            .into_client_request()
            .map_err(|err| McpError::Config(format!("Invalid WebSocket URL {url}: {err}")))?;
        for (name, value) in connection_headers(ctx.config) {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| McpError::Config(format!("Invalid header name {name}: {err}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|err| McpError::Config(format!("Invalid header value: {err}")))?;
            request.headers_mut().insert(name, value);
        }

        debug!(url = %url, "Connecting MCP WebSocket");
        let (socket, _) = connect_async(request).await.map_err(|err| {
            McpError::transport(format!("Failed to connect to WebSocket at {url}: {err}"))
        })?;
        Ok(socket)
    }

    async fn exchange(
        &self,
        ctx: CallContext<'_>,
        request: &JsonRpcRequest,
        id: u64,
    ) -> Result<Value, McpError> {
        let socket = self.open(ctx).await?;
        let (mut sender, mut receiver) = socket.split();

        let payload = serde_json::to_string(request)?;
        sender
            .send(Message::Text(payload.into()))
            .await
            .map_err(|err| McpError::transport(format!("Failed to send WebSocket message: {err}")))?;

        while let Some(message) = receiver.next().await {
            let message = message
                .map_err(|err| McpError::transport(format!("WebSocket error: {err}")))?;
            let text = match message {
                Message::Text(text) => text.as_str().to_string(),
                Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Message::Close(frame) => return Err(close_error(frame.as_ref())),
                _ => continue,
            };

            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                debug!(request_id = id, "Skipping non-JSON WebSocket frame");
                continue;
            };
            for response in responses_in(value) {
                if response.correlation_id() == Some(id) {
                    let _ = sender.send(Message::Close(None)).await;
                    return response.into_result();
                }
                debug!(request_id = id, "Skipping unrelated WebSocket response");
            }
        }

        Err(McpError::transport(
            "WebSocket connection closed unexpectedly",
        ))
    }
}

/// Close before the response arrives is always a failure; only the message differs.
fn close_error(frame: Option<&CloseFrame>) -> McpError {
    match frame {
        Some(frame) if frame.code == CloseCode::Normal => McpError::Closed(
            "WebSocket closed normally before a response arrived".to_string(),
        ),
        Some(frame) => McpError::transport(format!(
            "WebSocket closed with code {}: {}",
            u16::from(frame.code),
            frame.reason.as_str()
        )),
        None => McpError::transport("WebSocket closed without a status code"),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
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
        let method = request.method.clone();
        let after_ms = ctx.timeout_ms();
        run_cancellable(ctx.cancel, async {
            tokio::time::timeout(ctx.timeout, self.exchange(ctx, &request, id))
                .await
                .map_err(|_| McpError::Timeout { method, after_ms })?
        })
        .await
    }

    /// Sockets live for one request, so there is no session for a notification to reach.
    async fn notify(
        &self,
        ctx: CallContext<'_>,
        notification: JsonRpcRequest,
    ) -> Result<(), McpError> {
        debug!(
            url = %ctx.config.url,
            method = %notification.method,
            "Skipping MCP notification on WebSocket"
        );
        Ok(())
    }

    async fn invalidate(&self, _url: &str) {}

    async fn cleanup(&self, _url: &str) {}

    async fn cleanup_all(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_close_without_response_is_closed_error() {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        assert!(matches!(close_error(Some(&frame)), McpError::Closed(_)));
    }

    #[tokio::test]
    async fn notifications_open_no_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local addr should resolve");
        drop(listener);

        let config = crate::core::config::ConnectionConfig::new("ws", format!("ws://{addr}"));
        WebSocketTransport::new()
            .notify(
                CallContext::new(&config),
                JsonRpcRequest::notification("notifications/initialized", None),
            )
            .await
            .expect("notification should be skipped");
    }

    #[test]
    fn abnormal_close_reports_code() {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: "denied".into(),
        };
        let err = close_error(Some(&frame));
        assert_eq!(
            err.to_string(),
            "MCP transport error: WebSocket closed with code 1008: denied"
        );
        assert!(err.is_retryable());
    }
}
