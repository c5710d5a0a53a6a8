//! Error taxonomy shared by every MCP transport and the client orchestrator.

use serde_json::Value;
use thiserror::Error;

/// JSON-RPC code for an unknown method.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC code for rejected parameters.
pub const MCP_INVALID_PARAMS: i64 = -32602;
/// JSON-RPC code for a malformed request envelope.
pub const MCP_INVALID_REQUEST: i64 = -32600;

const FATAL_PROTOCOL_CODES: &[i64] = &[
    MCP_METHOD_NOT_FOUND,
    MCP_INVALID_PARAMS,
    MCP_INVALID_REQUEST,
];

/// Failures surfaced by the protocol client.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// Network failure or unexpected HTTP status.
    #[error("{}", format_transport(.status, .message))]
    Transport {
        message: String,
        status: Option<u16>,
    },

    /// Well-formed JSON-RPC `error` object returned by the server.
    #[error("{}", format_rpc_error(*.code, .message, .data.as_ref()))]
    Protocol {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// No response arrived before the per-call deadline.
    #[error("MCP request {method} timed out after {after_ms} ms")]
    Timeout { method: String, after_ms: u64 },

    /// The caller cancelled the operation.
    #[error("MCP operation interrupted by user.")]
    Aborted,

    /// The SSE message endpoint no longer recognizes the session.
    #[error("MCP session expired (HTTP {status})")]
    SessionExpired { status: u16 },

    /// The server answered with something that is not a usable JSON-RPC payload.
    #[error("Invalid MCP response: {0}")]
    InvalidResponse(String),

    /// The connection configuration cannot be used.
    #[error("Invalid MCP connection config: {0}")]
    Config(String),

    /// The owning SSE session was torn down while the request was pending.
    #[error("MCP session closed: {0}")]
    Closed(String),
}

impl McpError {
    pub fn transport(message: impl Into<String>) -> Self {
        McpError::Transport {
            message: message.into(),
            status: None,
        }
    }

    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        McpError::Transport {
            message: message.into(),
            status: Some(status),
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, McpError::Aborted)
    }

    /// Whether the retry loop may try the operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            McpError::Transport { .. }
            | McpError::Timeout { .. }
            | McpError::SessionExpired { .. }
            | McpError::Closed(_) => true,
            McpError::Protocol { code, .. } => !FATAL_PROTOCOL_CODES.contains(code),
            McpError::InvalidResponse(_) => true,
            McpError::Aborted | McpError::Config(_) => false,
        }
    }

    /// Whether cached sessions for the connection should be dropped before retrying.
    pub fn indicates_stale_session(&self) -> bool {
        match self {
            McpError::SessionExpired { .. } | McpError::Closed(_) => true,
            McpError::Transport { status, message } => {
                matches!(status, Some(400 | 404))
                    || message.to_ascii_lowercase().contains("session")
            }
            McpError::Protocol { message, .. } => {
                let lowered = message.to_ascii_lowercase();
                lowered.contains("session")
                    && ["invalid", "not found", "expired", "unknown"]
                        .iter()
                        .any(|marker| lowered.contains(marker))
            }
            _ => false,
        }
    }

    pub fn is_method_not_found(&self) -> bool {
        matches!(self, McpError::Protocol { code, .. } if *code == MCP_METHOD_NOT_FOUND)
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        McpError::Transport {
            message: err.to_string(),
            status: err.status().map(|status| status.as_u16()),
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::InvalidResponse(err.to_string())
    }
}

fn format_transport(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(status) if message.is_empty() => format!("HTTP error: {status}"),
        Some(status) => format!("HTTP error: {status}: {message}"),
        None => format!("MCP transport error: {message}"),
    }
}

pub(crate) fn format_rpc_error(code: i64, message: &str, data: Option<&Value>) -> String {
    let mut output = format!("MCP error {code}: {message}");
    if let Some(data) = data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string_pretty(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fatal_protocol_codes_are_not_retried() {
        let not_found = McpError::Protocol {
            code: MCP_METHOD_NOT_FOUND,
            message: "nope".to_string(),
            data: None,
        };
        let invalid = McpError::Protocol {
            code: MCP_INVALID_PARAMS,
            message: "bad".to_string(),
            data: None,
        };
        let internal = McpError::Protocol {
            code: -32603,
            message: "boom".to_string(),
            data: None,
        };
        assert!(!not_found.is_retryable());
        assert!(!invalid.is_retryable());
        assert!(internal.is_retryable());
    }

    #[test]
    fn abort_is_never_retryable() {
        assert!(!McpError::Aborted.is_retryable());
        assert!(McpError::Aborted.is_abort());
    }

    #[test]
    fn stale_session_detection_covers_statuses_and_messages() {
        assert!(McpError::SessionExpired { status: 404 }.indicates_stale_session());
        assert!(McpError::http_status(400, "").indicates_stale_session());
        assert!(McpError::transport("Unknown session id").indicates_stale_session());
        assert!(!McpError::http_status(500, "").indicates_stale_session());
        assert!(!McpError::Aborted.indicates_stale_session());
    }

    #[test]
    fn rpc_error_display_includes_details() {
        let err = McpError::Protocol {
            code: -32000,
            message: "Tool failed".to_string(),
            data: Some(json!({"details": "disk full"})),
        };
        assert_eq!(err.to_string(), "MCP error -32000: Tool failed\ndisk full");
    }

    #[test]
    fn transport_display_mentions_status() {
        assert_eq!(
            McpError::http_status(502, "").to_string(),
            "HTTP error: 502"
        );
        assert_eq!(
            McpError::transport("connection refused").to_string(),
            "MCP transport error: connection refused"
        );
    }
}
