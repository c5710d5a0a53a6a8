use crate::mcp::protocol::ToolOutput;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Success,
    Error,
}

/// Outcome of one `tools/call`, created pending and finished exactly once.
///
/// `succeed` and `fail` consume the record, so a finished record cannot be
/// reopened or reused for another call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionRecord {
    pub id: String,
    pub tool_name: String,
    pub status: ExecutionStatus,
    pub request_args: Value,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl ToolExecutionRecord {
    pub fn pending(tool_name: impl Into<String>, request_args: Value) -> Self {
        Self {
            id: execution_id(),
            tool_name: tool_name.into(),
            status: ExecutionStatus::Pending,
            request_args,
            timestamp: Utc::now(),
            duration_ms: 0,
            result: None,
            error: None,
            started: Some(Instant::now()),
        }
    }

    pub fn succeed(mut self, output: ToolOutput) -> Self {
        self.finish(ExecutionStatus::Success);
        self.result = Some(output);
        self
    }

    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.finish(ExecutionStatus::Error);
        self.error = Some(error.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ExecutionStatus::Pending
    }

    fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        if let Some(started) = self.started.take() {
            self.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        }
    }
}

fn execution_id() -> String {
    let mut suffix = [0_u8; 4];
    let suffix = match getrandom::fill(&mut suffix) {
        Ok(()) => u32::from_le_bytes(suffix),
        Err(_) => std::process::id(),
    };
    format!("exec-{}-{:08x}", Utc::now().timestamp_millis(), suffix)
}
