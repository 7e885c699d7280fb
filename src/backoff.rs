//! Inter-retry delay policies.
//!
//! A [`BackoffPolicy`] describes how long to wait before re-attempting a failed delivery.
//! Three growth shapes are provided — constant, linear, and exponential (doubling) — each
//! optionally capped via [`BackoffPolicy::with_max`] and optionally randomized via
//! [`BackoffPolicy::with_jitter`].
//!
//! All constructors and configuration functions are `const`, so a policy can be stored in a
//! `const` and attached to every job of a given kind.
//!
//! # Example
//!
//! ```
//! use chrono::TimeDelta;
//! use remindq::backoff::BackoffPolicy;
//!
//! let policy = BackoffPolicy::exponential(TimeDelta::seconds(60))
//!     .with_max(TimeDelta::seconds(300));
//!
//! assert_eq!(policy.delay(1), TimeDelta::seconds(60));
//! assert_eq!(policy.delay(2), TimeDelta::seconds(120));
//! assert_eq!(policy.delay(3), TimeDelta::seconds(240));
//! assert_eq!(policy.delay(4), TimeDelta::seconds(300));
//! assert_eq!(policy.delay(5), TimeDelta::seconds(300));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// How the delay grows with the attempt number.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Growth {
    Constant,
    Linear,
    Exponential,
}

/// A random offset applied on top of the computed delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Added in the range `-delta ..= delta`.
    Absolute(TimeDelta),
    /// Added as a proportion of the computed delay.
    Relative(f64),
}

impl Jitter {
    fn apply(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        if milliseconds <= 0 {
            return value;
        }
        let offset = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(offset)
    }
}

/// The delay to wait before re-attempting a failed job.
///
/// `delay(attempt)` is the wait installed after the `attempt`-th attempt has failed; the
/// first retry therefore waits `delay(1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    growth: Growth,
    base: TimeDelta,
    max: Option<TimeDelta>,
    jitter: Option<Jitter>,
}

impl BackoffPolicy {
    /// The same delay for every retry.
    ///
    /// ```
    /// use chrono::TimeDelta;
    /// use remindq::backoff::BackoffPolicy;
    ///
    /// let policy = BackoffPolicy::constant(TimeDelta::seconds(10));
    ///
    /// assert_eq!(policy.delay(1), TimeDelta::seconds(10));
    /// assert_eq!(policy.delay(7), TimeDelta::seconds(10));
    /// ```
    pub const fn constant(delay: TimeDelta) -> Self {
        Self {
            growth: Growth::Constant,
            base: delay,
            max: None,
            jitter: None,
        }
    }

    /// Delay grows by `step` with every attempt.
    ///
    /// ```
    /// use chrono::TimeDelta;
    /// use remindq::backoff::BackoffPolicy;
    ///
    /// let policy = BackoffPolicy::linear(TimeDelta::seconds(10));
    ///
    /// assert_eq!(policy.delay(1), TimeDelta::seconds(10));
    /// assert_eq!(policy.delay(3), TimeDelta::seconds(30));
    /// ```
    pub const fn linear(step: TimeDelta) -> Self {
        Self {
            growth: Growth::Linear,
            base: step,
            max: None,
            jitter: None,
        }
    }

    /// Delay doubles with every attempt, starting from `base`.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self {
            growth: Growth::Exponential,
            base,
            max: None,
            jitter: None,
        }
    }

    /// Caps the computed delay. Jitter is applied after the cap.
    pub const fn with_max(self, max: TimeDelta) -> Self {
        Self {
            growth: self.growth,
            base: self.base,
            max: Some(max),
            jitter: self.jitter,
        }
    }

    /// Randomizes the computed delay.
    pub const fn with_jitter(self, jitter: Jitter) -> Self {
        Self {
            growth: self.growth,
            base: self.base,
            max: self.max,
            jitter: Some(jitter),
        }
    }

    /// The delay to install after the given (1-based) attempt has failed.
    pub fn delay(&self, attempt: u16) -> TimeDelta {
        let attempt = attempt.max(1);
        let raw = match self.growth {
            Growth::Constant => self.base,
            Growth::Linear => self.base * i32::from(attempt),
            Growth::Exponential => {
                let factor = 2_i64
                    .checked_pow(u32::from(attempt) - 1)
                    .unwrap_or(i64::MAX);
                TimeDelta::milliseconds(self.base.num_milliseconds().saturating_mul(factor))
            }
        };
        let capped = match self.max {
            Some(max) if raw > max => max,
            _ => raw,
        };
        match self.jitter {
            Some(jitter) => jitter.apply(capped),
            None => capped,
        }
    }
}
