//! Bounded exponential backoff: delay sequence and worst-case elapsed time.
//!
//! Attempts are numbered from 1. The delay *after* attempt `i` is
//! `min(initial_delay * multiplier^(i-1), max_delay)`, and no delay follows
//! the final attempt. Delays are computed at millisecond precision.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(10_000);

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Retry shape shared by every stage that retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Growth factor applied per subsequent attempt. Must be `> 1`.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl BackoffPolicy {
    /// Reject parameters that would make the retry budget meaningless.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts == 0 {
            return Err(CoreError::Configuration(
                "max_attempts must be at least 1".into(),
            ));
        }
        validate_curve(self.initial_delay, self.multiplier, self.max_delay)
    }

    /// Delay that follows attempt `attempt` (1-based).
    ///
    /// Returns zero for attempt 0 and for the final attempt, since no
    /// wait follows either.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 || attempt >= self.max_attempts {
            return Duration::ZERO;
        }
        curve(attempt, self.initial_delay, self.multiplier, self.max_delay)
    }

    /// Every inter-attempt delay, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(|i| self.delay_for(i))
    }

    /// Worst-case time for all attempts to time out, including delays.
    pub fn total_elapsed(&self, per_attempt_timeout: Duration) -> Duration {
        let attempts = per_attempt_timeout
            .checked_mul(self.max_attempts)
            .unwrap_or(Duration::MAX);
        self.delays()
            .fold(attempts, |acc, d| acc.saturating_add(d))
    }
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Delay after attempt `attempt_index` (1-based) for the given curve.
pub fn backoff_delay(
    attempt_index: u32,
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
) -> Result<Duration, CoreError> {
    if attempt_index == 0 {
        return Err(CoreError::Validation(
            "attempt index is 1-based; got 0".into(),
        ));
    }
    validate_curve(initial_delay, multiplier, max_delay)?;
    Ok(curve(attempt_index, initial_delay, multiplier, max_delay))
}

/// Worst-case elapsed time for `max_attempts` attempts that all time out.
pub fn total_elapsed(
    per_attempt_timeout: Duration,
    max_attempts: u32,
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
) -> Result<Duration, CoreError> {
    if per_attempt_timeout.is_zero() {
        return Err(CoreError::Configuration(
            "per-attempt timeout must be greater than zero".into(),
        ));
    }
    let policy = BackoffPolicy {
        max_attempts,
        initial_delay,
        multiplier,
        max_delay,
    };
    policy.validate()?;
    Ok(policy.total_elapsed(per_attempt_timeout))
}

fn validate_curve(
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
) -> Result<(), CoreError> {
    if initial_delay.is_zero() {
        return Err(CoreError::Configuration(
            "initial_delay must be greater than zero".into(),
        ));
    }
    if !multiplier.is_finite() || multiplier <= 1.0 {
        return Err(CoreError::Configuration(format!(
            "multiplier must be a finite number greater than 1; got {multiplier}"
        )));
    }
    if max_delay.is_zero() {
        return Err(CoreError::Configuration(
            "max_delay must be greater than zero".into(),
        ));
    }
    Ok(())
}

fn curve(attempt: u32, initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Duration {
    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let scaled_ms = initial_delay.as_millis() as f64 * multiplier.powi(exponent);
    let max_ms = max_delay.as_millis() as f64;
    if !scaled_ms.is_finite() || scaled_ms >= max_ms {
        max_delay
    } else {
        Duration::from_millis(scaled_ms.round() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
