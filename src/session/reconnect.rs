//! Exponential-backoff reconnection policy.
//!
//! On transport loss while the session is still logically active, reconnects
//! are scheduled at `base * 2^(attempt-1)` up to a bounded attempt count.
//! Exceeding the cap is fatal: the session moves to `Error` and offers the
//! caller a manual retry instead of retrying silently forever.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnection backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    pub max_attempts: u32,

    /// Delay before the first attempt (milliseconds).
    pub base_delay_ms: u64,

    /// Ceiling on any single delay (milliseconds).
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    /// Delay scheduled before the given attempt (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX))
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Whether the given attempt (1-based) is still within the cap.
    pub fn should_attempt(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
