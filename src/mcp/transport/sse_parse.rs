//! Line-level parsing for `text/event-stream` bodies.
//!
//! The same pieces serve the long-lived SSE session listener and HTTP POST
//! responses that come back SSE-framed.

use crate::mcp::error::McpError;
use crate::mcp::protocol::{responses_in, JsonRpcResponse};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

const JSONRPC_MARKER: &str = "\"jsonrpc\"";

/// Splits a byte stream into trimmed, non-empty lines across chunk boundaries.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = memchr::memchr(b'\n', &self.buffer[search_index..]) {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            push_trimmed(&mut lines, &self.buffer[search_index..line_end]);
            search_index = newline_index + 1;
        }

        if flush {
            push_trimmed(&mut lines, &self.buffer[search_index..]);
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

fn push_trimmed(lines: &mut Vec<String>, bytes: &[u8]) {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        lines.push(trimmed.to_string());
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

pub fn sse_event_name(line: &str) -> Option<&str> {
    line.strip_prefix("event:").map(str::trim)
}

/// Comment lines and `ping -`/`pong -` heartbeats carry no protocol data.
///
/// Heartbeat text only counts at the start of the line or of its `data:`
/// payload, so JSON that merely mentions it is kept.
pub fn is_keep_alive_line(line: &str) -> bool {
    if line.starts_with(':') {
        return true;
    }
    if sse_event_name(line).is_some_and(|name| name.eq_ignore_ascii_case("ping")) {
        return true;
    }
    starts_with_heartbeat(line) || sse_data_payload(line).is_some_and(starts_with_heartbeat)
}

fn starts_with_heartbeat(text: &str) -> bool {
    let head = text.get(..6).unwrap_or(text);
    head.eq_ignore_ascii_case("ping -") || head.eq_ignore_ascii_case("pong -")
}

fn session_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r#"(?i)session[_-]?id["']?\s*[=:]\s*["']?([A-Za-z0-9._~\-]+)"#).ok()
        })
        .as_ref()
}

/// Pulls a session token out of an SSE handshake payload.
///
/// Accepts the query-string style (`/message?sessionId=abc`) and the
/// key-value style (`sessionId: abc`, `{"sessionId":"abc"}`).
pub fn extract_session_id(payload: &str) -> Option<String> {
    session_id_pattern()?
        .captures(payload)
        .and_then(|captures| captures.get(1))
        .map(|token| token.as_str().to_string())
        .filter(|token| !token.is_empty())
}

/// Rebuilds JSON-RPC messages that servers spread over several `data:` lines.
///
/// Fragments following `event: message` are concatenated while a bracket depth
/// counter runs; a message is complete once the depth returns to zero and the
/// text carries the `"jsonrpc"` marker. Brackets inside string literals are not
/// counted.
#[derive(Debug, Default)]
pub struct SseMessageAssembler {
    in_message_event: bool,
    buffer: String,
    depth: i64,
    in_string: bool,
    escaped: bool,
}

impl SseMessageAssembler {
    /// Feeds one SSE line and returns any JSON-RPC payloads it completed.
    pub fn feed_line(&mut self, line: &str) -> Vec<Value> {
        if let Some(event) = sse_event_name(line) {
            self.in_message_event = event.eq_ignore_ascii_case("message");
            if !self.buffer.is_empty() {
                debug!(
                    discarded_bytes = self.buffer.len(),
                    "Discarding incomplete SSE message before new event"
                );
            }
            self.reset_buffer();
            return Vec::new();
        }
        if is_keep_alive_line(line) {
            return Vec::new();
        }
        let Some(payload) = sse_data_payload(line) else {
            return Vec::new();
        };
        if payload.is_empty() {
            return Vec::new();
        }

        if self.buffer.is_empty() {
            let looks_like_json = payload.starts_with('{') || payload.starts_with('[');
            if !looks_like_json {
                return Vec::new();
            }
            if !self.in_message_event {
                if let Ok(value) = serde_json::from_str::<Value>(payload) {
                    return vec![value];
                }
            }
        }

        self.push_fragment(payload)
    }

    /// Whether a partial message is still buffered.
    pub fn is_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn push_fragment(&mut self, fragment: &str) -> Vec<Value> {
        self.buffer.push_str(fragment);
        for ch in fragment.chars() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if ch == '\\' {
                    self.escaped = true;
                } else if ch == '"' {
                    self.in_string = false;
                }
                continue;
            }
            match ch {
                '"' => self.in_string = true,
                '{' | '[' => self.depth += 1,
                '}' | ']' => self.depth -= 1,
                _ => {}
            }
        }

        if self.depth > 0 || self.in_string {
            return Vec::new();
        }

        let text = std::mem::take(&mut self.buffer);
        self.reset_buffer();
        self.in_message_event = false;
        if !text.contains(JSONRPC_MARKER) {
            debug!(bytes = text.len(), "Dropping balanced SSE payload without jsonrpc marker");
            return Vec::new();
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => vec![value],
            Err(err) => {
                debug!(error = %err, "Dropping unparsable SSE message");
                Vec::new()
            }
        }
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }
}

/// Decoded body of an HTTP POST answer.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpBody {
    Message(JsonRpcResponse),
    /// The server only sent keep-alive frames.
    KeepAliveOnly,
    Empty,
}

/// Decodes a POST response that is either bare JSON or SSE-framed.
pub fn decode_http_body(
    content_type: &str,
    body: &str,
    expected_id: Option<u64>,
) -> Result<HttpBody, McpError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(HttpBody::Empty);
    }

    let framed = is_event_stream_content_type(content_type)
        || trimmed.starts_with("event:")
        || trimmed.starts_with("data:")
        || trimmed.starts_with(':');

    if !framed {
        let value = serde_json::from_str::<Value>(trimmed)?;
        return select_response(responses_in(value), expected_id)
            .map(HttpBody::Message)
            .ok_or_else(|| {
                McpError::InvalidResponse("response body carries no JSON-RPC response".to_string())
            });
    }

    let mut lines = SseLineBuffer::default();
    let mut scan = ResponseScan::new(expected_id);
    for line in lines.push(trimmed.as_bytes()).iter().chain(lines.finish().iter()) {
        if let Some(response) = scan.feed_line(line) {
            return Ok(HttpBody::Message(response));
        }
    }
    scan.finish()
}

/// Incremental search for the response to one request inside an event stream.
#[derive(Debug)]
pub struct ResponseScan {
    expected_id: Option<u64>,
    assembler: SseMessageAssembler,
    saw_data: bool,
    fallback: Option<JsonRpcResponse>,
}

impl ResponseScan {
    pub fn new(expected_id: Option<u64>) -> Self {
        Self {
            expected_id,
            assembler: SseMessageAssembler::default(),
            saw_data: false,
            fallback: None,
        }
    }

    /// Returns the matching response as soon as it is complete.
    pub fn feed_line(&mut self, line: &str) -> Option<JsonRpcResponse> {
        if !is_keep_alive_line(line) && sse_data_payload(line).is_some_and(|data| !data.is_empty())
        {
            self.saw_data = true;
        }
        for value in self.assembler.feed_line(line) {
            for response in responses_in(value) {
                match (self.expected_id, response.correlation_id()) {
                    (None, _) => return Some(response),
                    (Some(expected), Some(found)) if expected == found => return Some(response),
                    // Errors without an id answer a request the server could not parse.
                    (Some(_), None) if response.error.is_some() && self.fallback.is_none() => {
                        self.fallback = Some(response);
                    }
                    _ => {}
                }
            }
        }
        None
    }

    pub fn finish(self) -> Result<HttpBody, McpError> {
        if let Some(response) = self.fallback {
            return Ok(HttpBody::Message(response));
        }
        if self.saw_data {
            return Err(McpError::InvalidResponse(
                "event-stream body carries no matching JSON-RPC response".to_string(),
            ));
        }
        Ok(HttpBody::KeepAliveOnly)
    }
}

fn select_response(
    responses: Vec<JsonRpcResponse>,
    expected_id: Option<u64>,
) -> Option<JsonRpcResponse> {
    match expected_id {
        Some(id) => {
            let mut fallback = None;
            for response in responses {
                match response.correlation_id() {
                    Some(found) if found == id => return Some(response),
                    None if response.error.is_some() && fallback.is_none() => {
                        fallback = Some(response)
                    }
                    _ => {}
                }
            }
            fallback
        }
        None => responses.into_iter().next(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sse_buffer_handles_partial_lines() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: one").is_empty());
        assert_eq!(buffer.push(b"\r\n\n"), vec!["data: one"]);
        assert_eq!(buffer.push(b"data: t"), Vec::<String>::new());
        assert_eq!(buffer.push(b"wo\n"), vec!["data: two"]);
        assert!(buffer.finish().is_empty());
    }

    #[test]
    fn sse_buffer_flushes_trailing_line() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: tail").is_empty());
        assert_eq!(buffer.finish(), vec!["data: tail"]);
    }

    #[test]
    fn detects_event_stream_content_type() {
        assert!(is_event_stream_content_type("text/event-stream"));
        assert!(is_event_stream_content_type("Text/Event-Stream; charset=UTF-8"));
        assert!(!is_event_stream_content_type("application/json"));
    }

    #[test]
    fn extracts_query_string_session_ids() {
        assert_eq!(
            extract_session_id("/message?sessionId=abc-123"),
            Some("abc-123".to_string())
        );
        assert_eq!(
            extract_session_id("/messages/?session_id=9f8e7d6c"),
            Some("9f8e7d6c".to_string())
        );
    }

    #[test]
    fn extracts_key_value_session_ids() {
        assert_eq!(
            extract_session_id("sessionId: s_42"),
            Some("s_42".to_string())
        );
        assert_eq!(
            extract_session_id(r#"{"sessionId":"tok.en"}"#),
            Some("tok.en".to_string())
        );
        assert_eq!(extract_session_id("hello world"), None);
    }

    #[test]
    fn keep_alive_lines_are_recognized() {
        assert!(is_keep_alive_line(": ping - 2025-01-01T00:00:00Z"));
        assert!(is_keep_alive_line("data: ping - 2025-01-01"));
        assert!(is_keep_alive_line("pong - 17"));
        assert!(is_keep_alive_line("event: ping"));
        assert!(!is_keep_alive_line("data: {\"jsonrpc\":\"2.0\"}"));
    }

    #[test]
    fn heartbeat_text_inside_json_is_not_a_keep_alive() {
        assert!(!is_keep_alive_line(
            r#"data: {"jsonrpc":"2.0","id":1,"result":{"content":[{"type":"text","text":"ping - ok"}]}}"#
        ));
        assert!(!is_keep_alive_line(r#"data: "text":"pong - 3 hosts"}]}}"#));
        assert!(!is_keep_alive_line("data: PING-less"));
    }

    #[test]
    fn heartbeat_text_in_a_middle_fragment_is_reassembled() {
        let lines = [
            r#"data: {"jsonrpc":"2.0","id":7,"result":{"content":[{"type":"text","#.to_string(),
            r#"data: "text":"ping - host reachable"}]}}"#.to_string(),
        ];
        let out = reassemble(&lines);
        assert_eq!(
            out,
            vec![json!({
                "jsonrpc": "2.0",
                "id": 7,
                "result": {"content": [{"type": "text", "text": "ping - host reachable"}]}
            })]
        );
    }

    fn reassemble(lines: &[String]) -> Vec<Value> {
        let mut assembler = SseMessageAssembler::default();
        let mut out = Vec::new();
        out.extend(assembler.feed_line("event: message"));
        for line in lines {
            out.extend(assembler.feed_line(line));
        }
        out
    }

    #[test]
    fn reassembly_is_independent_of_line_splits() {
        let message = r#"{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"a {b} [c]"}]}}"#;
        let expected: Value = serde_json::from_str(message).expect("fixture should parse");

        let whole = reassemble(&[format!("data: {message}")]);
        assert_eq!(whole, vec![expected.clone()]);

        for parts in [2_usize, 3, 7, 19] {
            let chunk = message.len().div_ceil(parts);
            let lines: Vec<String> = message
                .as_bytes()
                .chunks(chunk)
                .map(|piece| format!("data:{}", String::from_utf8_lossy(piece)))
                .filter(|line| line != "data:")
                .collect();
            let rebuilt = reassemble(&lines);
            assert_eq!(rebuilt, vec![expected.clone()], "split into {parts} lines");
        }
    }

    #[test]
    fn balanced_payload_without_marker_is_dropped() {
        let out = reassemble(&["data: {\"hello\":".to_string(), "data: 1}".to_string()]);
        assert!(out.is_empty());
    }

    #[test]
    fn standalone_data_line_is_parsed_opportunistically() {
        let mut assembler = SseMessageAssembler::default();
        let out = assembler.feed_line(r#"data: {"jsonrpc":"2.0","id":1,"result":{}}"#);
        assert_eq!(out, vec![json!({"jsonrpc": "2.0", "id": 1, "result": {}})]);
        assert!(assembler.feed_line("data: /message?sessionId=x").is_empty());
    }

    #[test]
    fn new_event_discards_partial_message() {
        let mut assembler = SseMessageAssembler::default();
        assembler.feed_line("event: message");
        assembler.feed_line(r#"data: {"jsonrpc":"2.0","#);
        assert!(assembler.is_pending());
        assembler.feed_line("event: endpoint");
        assert!(!assembler.is_pending());
    }

    #[test]
    fn decodes_bare_json_body() {
        let body = r#"{"jsonrpc":"2.0","id":5,"result":{"ok":true}}"#;
        let decoded = decode_http_body("application/json", body, Some(5)).expect("decode");
        let HttpBody::Message(response) = decoded else {
            panic!("expected a message");
        };
        assert_eq!(response.result, Some(json!({"ok": true})));
    }

    #[test]
    fn decodes_sse_framed_body_and_skips_other_ids() {
        let body = concat!(
            ": ping - 1\n\n",
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n",
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":9,\"result\":{}}\n\n",
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"ok\":1}}\n\n"
        );
        let decoded = decode_http_body("text/event-stream", body, Some(2)).expect("decode");
        let HttpBody::Message(response) = decoded else {
            panic!("expected a message");
        };
        assert_eq!(response.correlation_id(), Some(2));
    }

    #[test]
    fn keep_alive_only_body_is_reported() {
        let body = ": ping - 2025-06-18T00:00:00Z\n\n: ping - 2025-06-18T00:00:15Z\n";
        assert_eq!(
            decode_http_body("text/event-stream", body, Some(1)).expect("decode"),
            HttpBody::KeepAliveOnly
        );
        assert_eq!(
            decode_http_body("application/json", "  ", Some(1)).expect("decode"),
            HttpBody::Empty
        );
    }

    #[test]
    fn framed_body_without_matching_response_is_an_error() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"id\":4,\"result\":{}}\n";
        assert!(decode_http_body("text/event-stream", body, Some(5)).is_err());
    }
}
