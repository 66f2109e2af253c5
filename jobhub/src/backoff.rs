//! Backoff strategies used to delay retries of failed jobs.
//!
//! Three curves are provided (constant, linear and exponential), each of which can be capped and
//! randomised with [`Jitter`]. All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use jobhub::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::linear(TimeDelta::seconds(20))
//!     .with_max(TimeDelta::seconds(60))
//!     .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::seconds(10));
//! assert!(strategy.backoff(1) <= TimeDelta::seconds(30));
//! assert!(strategy.backoff(2) >= TimeDelta::seconds(30));
//! assert!(strategy.backoff(2) <= TimeDelta::seconds(50));
//! // Note the max here is the max plus max jitter
//! assert!(strategy.backoff(10) >= TimeDelta::seconds(50));
//! assert!(strategy.backoff(10) <= TimeDelta::seconds(70));
//! ```
use chrono::TimeDelta;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Curve {
    Constant(TimeDelta),
    Linear(TimeDelta),
    Exponential(TimeDelta),
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the backoff in the range `-delta =< jitter =< delta`.
    Absolute(TimeDelta),
    /// A random jitter to be added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds().abs(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio.abs()).round() as i64,
        };
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// How long to wait before retry number `n` of a job.
///
/// The default, used by any task that does not choose its own, is a linear backoff of ten seconds
/// per retry capped at five minutes with ten percent jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy {
    curve: Curve,
    max: Option<TimeDelta>,
    min: TimeDelta,
    jitter: Option<Jitter>,
}

impl BackoffStrategy {
    const fn new(curve: Curve) -> Self {
        Self {
            curve,
            max: None,
            min: TimeDelta::zero(),
            jitter: None,
        }
    }

    /// No delay at all; retries are published immediately.
    pub const fn none() -> Self {
        Self::new(Curve::Constant(TimeDelta::zero()))
    }

    /// The same delay for every retry.
    ///
    /// ```
    /// # use jobhub::prelude::*;
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::constant(TimeDelta::seconds(10));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(10));
    /// assert_eq!(strategy.backoff(3), TimeDelta::seconds(10));
    /// ```
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Curve::Constant(delay))
    }

    /// A delay of `step * retry`.
    ///
    /// ```
    /// # use jobhub::prelude::*;
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::linear(TimeDelta::seconds(10)).with_max(TimeDelta::seconds(25));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(10));
    /// assert_eq!(strategy.backoff(2), TimeDelta::seconds(20));
    /// assert_eq!(strategy.backoff(3), TimeDelta::seconds(25));
    /// ```
    pub const fn linear(step: TimeDelta) -> Self {
        Self::new(Curve::Linear(step))
    }

    /// A delay of `base * 2^(retry - 1)`. It is advisable to also set [`BackoffStrategy::with_max`].
    ///
    /// ```
    /// # use jobhub::prelude::*;
    /// # use chrono::TimeDelta;
    /// let strategy =
    ///     BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
    /// assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
    /// assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
    /// assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
    /// ```
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Curve::Exponential(base))
    }

    /// Caps the delay before jitter is applied.
    pub const fn with_max(self, max: TimeDelta) -> Self {
        Self {
            max: Some(max),
            ..self
        }
    }

    /// The delay never drops below `min`, even after jitter.
    pub const fn with_min(self, min: TimeDelta) -> Self {
        Self { min, ..self }
    }

    pub const fn with_jitter(self, jitter: Jitter) -> Self {
        Self {
            jitter: Some(jitter),
            ..self
        }
    }

    /// The delay before retry number `retry` (starting at 1).
    pub fn backoff(&self, retry: u32) -> TimeDelta {
        let retry = retry.max(1);
        let ceiling = self
            .max
            .unwrap_or_else(|| TimeDelta::days(365))
            .num_milliseconds();
        let milliseconds = match self.curve {
            Curve::Constant(delay) => delay.num_milliseconds(),
            Curve::Linear(step) => step
                .num_milliseconds()
                .checked_mul(i64::from(retry))
                .unwrap_or(ceiling),
            Curve::Exponential(base) => 2_i64
                .checked_pow(retry - 1)
                .and_then(|factor| base.num_milliseconds().checked_mul(factor))
                .unwrap_or(ceiling),
        };
        let delay = TimeDelta::milliseconds(milliseconds.min(ceiling));
        let delay = match self.jitter {
            Some(jitter) => jitter.apply_jitter(delay),
            None => delay,
        };
        delay.max(self.min).max(TimeDelta::zero())
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::linear(TimeDelta::seconds(10))
            .with_max(TimeDelta::minutes(5))
            .with_jitter(Jitter::Relative(0.1))
    }
}
