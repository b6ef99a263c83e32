//! Bounded retry policies.
//!
//! Used by the coordinator's discovery/provisioning loop and by the pull
//! client when the queue server cannot be reached.

use std::time::Duration;

use rand::Rng;

use crate::config::{BackoffKind, RetryConfig};

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed; `None` means retry until cancelled.
    pub max_attempts: Option<usize>,
    pub delay: Duration,
    pub backoff: BackoffKind,
    pub max_delay: Duration,
    /// Adds up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl RetryPolicy {
    /// A fixed-delay policy with a hard attempt bound.
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            delay,
            backoff: BackoffKind::Fixed,
            max_delay: delay,
            jitter: false,
        }
    }

    /// A fixed-delay policy that never gives up on its own.
    pub fn unbounded(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            ..Self::fixed(0, delay)
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Returns `true` if attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: usize) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let base = match self.backoff {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let exp = attempt.saturating_sub(1).min(16) as u32;
                self.delay
                    .saturating_mul(2u32.saturating_pow(exp))
                    .min(self.max_delay.max(self.delay))
            }
        };
        if self.jitter && !base.is_zero() {
            let spread = base.as_millis() as u64 / 4;
            let extra = rand::thread_rng().gen_range(0..=spread);
            base + Duration::from_millis(extra)
        } else {
            base
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay: Duration::from_millis(config.delay_ms),
            backoff: config.backoff,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}
