//! Retry policy for failed handler runs.

use std::time::Duration;

/// Worker-side retry budget. Each failed handler run reports one retry fewer
/// until the task runs out and an incident opens.
#[derive(Debug, Clone, Default)]
pub enum RetryPolicy {
    /// Report zero retries on the first failure.
    #[default]
    None,

    /// Same pause before every refetch.
    Fixed { max_attempts: u32, delay: Duration },

    /// Pause doubles per attempt from `initial_delay`, never beyond `max_delay`.
    Exponential {
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
    },
}

/// Retries and retry delay to report with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retries: i32,
    pub delay: Duration,
}

impl RetryDecision {
    /// Give up: zero retries, no delay.
    pub fn exhausted() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn delay_ms(&self) -> i64 {
        i64::try_from(self.delay.as_millis()).unwrap_or(i64::MAX)
    }
}

impl RetryPolicy {
    /// Doubling pauses from one second up to five minutes.
    pub fn exponential(max_attempts: u32) -> Self {
        Self::Exponential {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed { max_attempts, delay }
    }

    /// Pause before retry `attempt`, counting from 1. `None` once the budget is spent.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed { max_attempts, delay } => (attempt <= *max_attempts).then_some(*delay),
            Self::Exponential {
                max_attempts,
                initial_delay,
                max_delay,
            } => {
                if attempt > *max_attempts || attempt == 0 {
                    return None;
                }
                let factor = 2u32.saturating_pow(attempt - 1);
                Some(initial_delay.saturating_mul(factor).min(*max_delay))
            }
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_attempts, .. } | Self::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    /// Decide what to report for a failure of a task whose retries are `current`.
    ///
    /// A task that never failed (`None`) starts with the full budget; each
    /// later failure spends one retry until zero is reached.
    pub fn next_failure(&self, current: Option<i32>) -> RetryDecision {
        let max = i32::try_from(self.max_attempts()).unwrap_or(i32::MAX);
        let retries = match current {
            None => max,
            Some(r) => (r - 1).max(0),
        };
        if retries == 0 {
            return RetryDecision::exhausted();
        }
        let attempt = u32::try_from(max - retries + 1).unwrap_or(1);
        RetryDecision {
            retries,
            delay: self.delay_for_attempt(attempt).unwrap_or(Duration::ZERO),
        }
    }
}
