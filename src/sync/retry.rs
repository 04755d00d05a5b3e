//! Retry Policy - decides whether a failed action is retried and when
//!
//! Pure decision logic: no clock, no I/O. The orchestrator feeds it the
//! action (with its attempt count already incremented) and the failure, and
//! gets back either a delay before the next attempt or an abandonment.

use super::api::DispatchError;
use super::models::OfflineAction;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_BASE_DELAY_MS: u64 = 1_000; // First retry: 1 second
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_DELAY_MS: u64 = 300_000; // Cap: 5 minutes

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed { delay_ms: u64 },
    /// `base * n` for the n-th retry
    Linear { base_ms: u64 },
    /// `base * multiplier^(n-1)` for the n-th retry
    Exponential { base_ms: u64, multiplier: f64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Abandon,
}

/// Retry policy shared by every queued action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub max_delay_ms: u64,
    /// Abandon on 4xx (except 408 and 429) without consuming further attempts
    #[serde(default)]
    pub abandon_client_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            abandon_client_errors: false,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
            ..Self::default()
        }
    }

    pub fn linear(base: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear {
                base_ms: base.as_millis() as u64,
            },
            ..Self::default()
        }
    }

    pub fn exponential(base: Duration, multiplier: f64) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential {
                base_ms: base.as_millis() as u64,
                multiplier,
            },
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    pub fn with_abandon_client_errors(mut self, enabled: bool) -> Self {
        self.abandon_client_errors = enabled;
        self
    }

    /// Decide from attempt counts alone.
    ///
    /// `attempts` is the number of attempts already made, including the one
    /// that just failed.
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> RetryDecision {
        if attempts >= max_attempts {
            return RetryDecision::Abandon;
        }

        RetryDecision::Retry {
            delay: self.delay_for(attempts),
        }
    }

    /// Decide for a failed dispatch of `action`
    pub fn decide_for(&self, action: &OfflineAction, error: &DispatchError) -> RetryDecision {
        if self.abandon_client_errors && error.is_permanent() {
            return RetryDecision::Abandon;
        }

        self.decide(action.attempts, action.max_attempts)
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);

        let raw_ms = match self.strategy {
            BackoffStrategy::Fixed { delay_ms } => delay_ms as f64,
            BackoffStrategy::Linear { base_ms } => base_ms as f64 * n as f64,
            BackoffStrategy::Exponential { base_ms, multiplier } => {
                base_ms as f64 * multiplier.powi(n as i32 - 1)
            }
        };

        let capped = raw_ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}
