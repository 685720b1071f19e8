//! Declarative retry data for steps.
//!
//! The engine never retries anything by itself.  A step may carry a
//! [`RetryPolicy`] that an external retry loop consults (through
//! [`Helpers::can_retry`](crate::helpers::Helpers::can_retry) and
//! [`Helpers::retry_delay`](crate::helpers::Helpers::retry_delay)) after a step was
//! marked `error`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// How often a failed step may be re-attempted, and how long to wait.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether another attempt is allowed after `attempts` entries into the step.
    ///
    /// The first entry is not a retry, so `max_retries` retries permit
    /// `max_retries + 1` attempts in total.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    /// Delay before the next attempt, or `None` once retries are exhausted.
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        if !self.allows(attempts) {
            return None;
        }
        Some(self.backoff.delay_for_attempt(attempts.saturating_sub(1)))
    }
}
