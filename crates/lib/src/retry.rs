//! Retry ceiling and exponential backoff for redelivered messages and publish attempts.

use crate::config::{PublishConfig, RetryConfig};
use crate::error::ProcessError;
use std::time::Duration;

/// Exponential backoff: `initial * multiplier^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Backoff {
    /// Delay after the failure of `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = (self.multiplier.max(1) as u64).saturating_pow(exponent);
        let ms = (self.initial.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(ms).min(self.max)
    }
}

impl From<&PublishConfig> for Backoff {
    fn from(c: &PublishConfig) -> Self {
        Self {
            initial: Duration::from_millis(c.initial_backoff_ms),
            max: Duration::from_millis(c.max_backoff_ms),
            multiplier: 2,
        }
    }
}

/// What to do with a message whose processing failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Make it available again as delivery `next_attempt` after `delay`.
    Retry { next_attempt: u32, delay: Duration },
    /// Terminal: record in the dead-letter destination and ack.
    DeadLetter,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Redeliveries allowed after the first attempt.
    pub ceiling: u32,
    pub backoff: Backoff,
    pub max_elapsed: Option<Duration>,
    pub retry_rejected: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            ceiling: c.ceiling,
            backoff: Backoff {
                initial: Duration::from_millis(c.initial_backoff_ms),
                max: Duration::from_millis(c.max_backoff_ms),
                multiplier: c.multiplier,
            },
            max_elapsed: c.max_elapsed_ms.map(Duration::from_millis),
            retry_rejected: c.retry_rejected,
        }
    }
}

impl RetryPolicy {
    /// Decide after `error` on delivery `attempt` (1-based) of a message first seen at
    /// `received_at_millis`. Malformed input never reaches here; the consumer drops it.
    pub fn decide(
        &self,
        error: &ProcessError,
        attempt: u32,
        received_at_millis: i64,
        now_millis: i64,
    ) -> Decision {
        if !error.is_transient(self.retry_rejected) {
            return Decision::DeadLetter;
        }
        if attempt > self.ceiling {
            return Decision::DeadLetter;
        }
        if let Some(max) = self.max_elapsed {
            let elapsed = now_millis.saturating_sub(received_at_millis).max(0) as u128;
            if elapsed >= max.as_millis() {
                return Decision::DeadLetter;
            }
        }
        Decision::Retry {
            next_attempt: attempt + 1,
            delay: self.backoff.delay(attempt),
        }
    }
}
