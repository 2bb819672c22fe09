//! Retry policy: outcome classification and exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::error::{CallError, Error, Result};
use crate::remote::{Response, TransportFailure};

/// How a completed attempt is treated.
#[derive(Debug, Clone)]
pub enum Classification {
    /// 2xx. Carries the decoded body, if any.
    Success(Option<serde_json::Value>),
    /// Not found. A defined result, not an error.
    Absence,
    /// 5xx or transport failure. Another attempt may succeed.
    Retryable(CallError),
    /// Conflict or any other client-side error. Never retried.
    Terminal(CallError),
}

/// Classify the outcome of one attempt.
pub fn classify(outcome: std::result::Result<Response, TransportFailure>) -> Classification {
    let response = match outcome {
        Ok(response) => response,
        Err(failure) => return Classification::Retryable(CallError::Transport(failure.to_string())),
    };

    match response.status {
        status if status < 300 => Classification::Success(response.body),
        404 => Classification::Absence,
        409 => Classification::Terminal(CallError::Conflict),
        status => {
            let error = CallError::Status {
                status,
                message: response.message(),
            };
            if status >= 500 {
                Classification::Retryable(error)
            } else {
                Classification::Terminal(error)
            }
        }
    }
}

/// Backoff configuration for a single remote call.
///
/// The delay before the retry that follows failed attempt `k` (0-based) is
/// `min(round(j * base_delay * growth^k), max_delay)` with `j` drawn
/// uniformly from `[1, 2)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub growth: f64,
    pub max_delay: Duration,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            growth: 2.0,
            max_delay: Duration::from_millis(5000),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Validation(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        if !self.growth.is_finite() || self.growth < 1.0 {
            return Err(Error::Validation(format!(
                "retry growth must be >= 1, got {}",
                self.growth
            )));
        }
        Ok(())
    }

    /// Whether failed attempt `attempt` (0-based) may be followed by another.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// Jittered delay to wait after failed attempt `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random::<f64>() + 1.0;
        self.delay_with_jitter(attempt, jitter)
    }

    /// Deterministic form of [`delay_for_attempt`](Self::delay_for_attempt);
    /// `jitter` is expected in `[1, 2)`.
    #[allow(clippy::cast_possible_wrap)] // exponent is capped at 31
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        // 2^31 already saturates any sane cap.
        let exp = attempt.min(31) as i32;
        let delay_ms = (jitter * base_ms * self.growth.powi(exp)).round();

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }

    /// Inclusive lower and upper bound of the delay after attempt `attempt`.
    pub fn bounds_for_attempt(&self, attempt: u32) -> (Duration, Duration) {
        (
            self.delay_with_jitter(attempt, 1.0),
            self.delay_with_jitter(attempt, 2.0),
        )
    }
}
