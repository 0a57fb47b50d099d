//! Poll budgets for request/response correlation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay between consecutive polls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Poll again right away
    Immediate,

    /// Same delay after every poll
    Fixed { delay_ms: u64 },

    /// Delay grows by `multiplier` after each poll, capped at `max_delay_ms`
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed { delay_ms: 1000 }
    }
}

impl Backoff {
    /// Delay after the given poll (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Self::Immediate => Duration::ZERO,
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                if attempt <= 1 {
                    return Duration::from_millis(initial_delay_ms.min(max_delay_ms));
                }

                let delay = initial_delay_ms as f64 * multiplier.powi((attempt - 1) as i32);
                let capped = delay.min(max_delay_ms as f64) as u64;
                Duration::from_millis(capped)
            }
        }
    }
}

/// How long a correlator keeps polling for its response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Total number of polls, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    200
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
        }
    }
}

impl PollPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(
            max_attempts,
            Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
        )
    }

    /// At least one poll always happens
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn should_poll_again(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}
