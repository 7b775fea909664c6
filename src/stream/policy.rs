use crate::stream::types::CloseInfo;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Bounded exponential backoff: `min(base_delay * 2^attempt, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRetry {
    pub attempt: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NotNeeded,
    Retry(ScheduledRetry),
    Exhausted { attempts: u32 },
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn evaluate(&self, attempt_count: u32, close: CloseInfo) -> RetryDecision {
        if close.was_clean {
            return RetryDecision::NotNeeded;
        }

        if attempt_count >= self.max_attempts {
            return RetryDecision::Exhausted {
                attempts: attempt_count,
            };
        }

        let attempt = attempt_count.saturating_add(1);
        RetryDecision::Retry(ScheduledRetry {
            attempt,
            delay: self.delay_for(attempt),
        })
    }
}
