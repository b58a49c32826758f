//! Retry pacing for failed jobs.
//!
//! A [`Backoff`] maps the number of times a job has failed to the delay
//! before it may be claimed again. `Job::error` is the only caller.

use std::sync::Arc;
use std::time::Duration;

/// Strategy mapping a job's error count to its retry delay.
///
/// Implementations must be monotonically non-decreasing in `error_count`.
pub trait Backoff: Send + Sync {
    /// Delay before a job that has failed `error_count` times is eligible again.
    fn delay(&self, error_count: i32) -> Duration;
}

impl<F> Backoff for F
where
    F: Fn(i32) -> Duration + Send + Sync,
{
    fn delay(&self, error_count: i32) -> Duration {
        self(error_count)
    }
}

/// Shared, type-erased backoff strategy.
pub type DynBackoff = Arc<dyn Backoff>;

/// Doubling delay: `base * 2^(error_count - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    pub base: Duration,
    pub max: Duration,
}

impl Exponential {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl Default for Exponential {
    /// 10 seconds for the first failure, doubling, at most one day.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            max: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl Backoff for Exponential {
    fn delay(&self, error_count: i32) -> Duration {
        if error_count <= 0 {
            return Duration::ZERO;
        }
        let exp = (error_count - 1).min(31) as u32;
        self.base
            .checked_mul(2u32.pow(exp))
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Same delay after every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant(pub Duration);

impl Backoff for Constant {
    fn delay(&self, _error_count: i32) -> Duration {
        self.0
    }
}

/// `step * error_count`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    pub step: Duration,
    pub max: Duration,
}

impl Backoff for Linear {
    fn delay(&self, error_count: i32) -> Duration {
        let n = error_count.max(0) as u32;
        self.step
            .checked_mul(n)
            .map_or(self.max, |d| d.min(self.max))
    }
}
