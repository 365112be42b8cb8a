//! Retry and priority policies for tile fetches.
//!
//! - [`RetryPolicy`]: how a fetch reacts to transient failures
//! - [`Priority`]: admission order, derived from screen-space error

use std::fmt;
use std::time::Duration;

// =============================================================================
// Retry Policy Constants
// =============================================================================

/// Default delay after the first failure.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Default cap on the back-off delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default back-off multiplier.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default attempts per fetch, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Scale from pixel error to priority units.
const PRIORITY_PER_PIXEL: f64 = 100.0;

/// How a fetch handles transient failures and timeouts.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryPolicy {
    /// Fail on the first error.
    None,

    /// Constant delay between attempts.
    Fixed {
        /// Attempts including the first.
        max_attempts: u32,
        delay: Duration,
    },

    /// Delay grows by `multiplier` after each failure, capped at `max_delay`.
    ExponentialBackoff {
        /// Attempts including the first.
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// Exponential back-off with the default delays.
    pub fn exponential(max_attempts: u32) -> Self {
        Self::ExponentialBackoff {
            max_attempts,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed {
            max_attempts,
            delay,
        }
    }

    /// Delay before the next attempt after `failed_attempts` failures.
    ///
    /// `None` once the attempt budget is spent.
    pub fn delay_for_attempt(&self, failed_attempts: u32) -> Option<Duration> {
        if failed_attempts >= self.max_attempts() {
            return None;
        }
        match self {
            Self::None => None,
            Self::Fixed { delay, .. } => Some(*delay),
            Self::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => {
                let exponent = failed_attempts.saturating_sub(1) as i32;
                let secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                let capped = secs.min(max_delay.as_secs_f64());
                Some(Duration::from_secs_f64(capped.max(0.0)))
            }
        }
    }

    /// Attempts allowed, including the first. Never zero.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => (*max_attempts).max(1),
            Self::ExponentialBackoff { max_attempts, .. } => (*max_attempts).max(1),
        }
    }
}

/// Fetch admission priority. Higher is admitted first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOWEST: Priority = Priority(i32::MIN);
    pub const HIGHEST: Priority = Priority(i32::MAX);

    pub fn new(value: i32) -> Self {
        Self(value)
    }

    /// Priority for a node whose screen-space error is `sse` pixels.
    pub fn from_error(sse: f64) -> Self {
        if sse.is_nan() {
            return Self::LOWEST;
        }
        let scaled = (sse * PRIORITY_PER_PIXEL).round();
        Self(scaled.clamp(i32::MIN as f64, i32::MAX as f64) as i32)
    }

    pub fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Priority({})", self.0)
    }
}
