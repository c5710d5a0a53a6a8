//! Exponential backoff with jitter for handshakes and tool calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const CONNECT_BASE_DELAY_MS: u64 = 1_000;
const CONNECT_MAX_DELAY_MS: u64 = 10_000;
const CONNECT_JITTER_MS: u64 = 1_000;

const TOOL_BASE_DELAY_MS: u64 = 500;
const TOOL_MAX_DELAY_MS: u64 = 4_000;
const TOOL_JITTER_MS: u64 = 250;
const TOOL_MAX_ATTEMPTS: u32 = 2;

/// Backoff parameters for one class of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    /// Slow, generous profile used for `initialize` and introspection.
    pub fn for_connection(retry_attempts: u32) -> Self {
        Self {
            max_attempts: retry_attempts.max(1),
            base_delay_ms: CONNECT_BASE_DELAY_MS,
            max_delay_ms: CONNECT_MAX_DELAY_MS,
            jitter_ms: CONNECT_JITTER_MS,
        }
    }

    /// Tight profile so tool calls fail fast inside a chat turn.
    pub fn for_tool_call(retry_attempts: u32) -> Self {
        Self {
            max_attempts: retry_attempts.clamp(1, TOOL_MAX_ATTEMPTS),
            base_delay_ms: TOOL_BASE_DELAY_MS,
            max_delay_ms: TOOL_MAX_DELAY_MS,
            jitter_ms: TOOL_JITTER_MS,
        }
    }

    /// Deterministic part of the delay: `min(cap, base * 2^attempt)`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Full delay before retrying after `attempt` (zero-based) failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, random_below(self.jitter_ms.saturating_add(1)))
    }

    pub(crate) fn delay_with_jitter(&self, attempt: u32, jitter_ms: u64) -> Duration {
        Duration::from_millis(
            self.backoff_ms(attempt)
                .saturating_add(jitter_ms.min(self.jitter_ms)),
        )
    }

    /// Whether another attempt is allowed after `attempt` (zero-based) failed.
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }
}

/// User overrides for the two retry profiles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub connection: Option<BackoffOverride>,
    pub tool_call: Option<BackoffOverride>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffOverride {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
}

impl BackoffOverride {
    pub fn apply(&self, policy: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms.max(self.base_delay_ms),
            jitter_ms: self.jitter_ms,
            ..policy
        }
    }
}

fn random_below(bound: u64) -> u64 {
    if bound <= 1 {
        return 0;
    }
    let mut bytes = [0_u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        return 0;
    }
    u64::from_le_bytes(bytes) % bound
}
