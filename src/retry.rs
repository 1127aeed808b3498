use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::ApiError;

type DelayFn = Arc<dyn Fn() -> Duration + Send + Sync>;
type PredicateFn = Arc<dyn Fn(&ApiError) -> bool + Send + Sync>;

/// How a request is retried after a failed attempt.
///
/// A policy with `remaining` N and an always-true predicate yields exactly
/// N + 1 attempts. The policy is consumed by value; `next()` returns the
/// follow-up policy with one fewer remaining retry and the same delay and
/// predicate closures.
#[derive(Clone)]
pub struct RetryPolicy {
    remaining: u32,
    delay: DelayFn,
    predicate: PredicateFn,
}

impl RetryPolicy {
    /// No retries: a single attempt, win or lose.
    pub fn none() -> Self {
        Self::count(0)
    }

    /// `remaining` immediate retries with no delay, for any error.
    pub fn count(remaining: u32) -> Self {
        Self {
            remaining,
            delay: Arc::new(|| Duration::ZERO),
            predicate: Arc::new(|_| true),
        }
    }

    /// `remaining` retries with a caller-supplied delay thunk. The thunk is
    /// evaluated once per retry, after the failed attempt.
    pub fn with_delay(
        remaining: u32,
        delay: impl Fn() -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            remaining,
            delay: Arc::new(delay),
            predicate: Arc::new(|_| true),
        }
    }

    /// `remaining` retries with jittered exponential backoff between `base`
    /// and `max`. Each evaluation of the delay doubles the previous one.
    pub fn backoff(remaining: u32, base: Duration, max: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        let max = max.max(base);
        let step = Arc::new(AtomicU32::new(0));
        Self::with_delay(remaining, move || {
            let exponent = step.fetch_add(1, Ordering::Relaxed).min(16);
            let scaled = base.saturating_mul(2_u32.saturating_pow(exponent)).min(max);
            let jitter = rand::rng().random_range(0.8..1.2_f64);
            scaled.mul_f64(jitter).min(max)
        })
    }

    /// Restricts which errors are worth retrying. Errors rejected by the
    /// predicate fail immediately, regardless of remaining retries.
    pub fn retry_if(
        mut self,
        predicate: impl Fn(&ApiError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub(crate) fn should_retry(&self, error: &ApiError) -> bool {
        self.remaining > 0 && (self.predicate)(error)
    }

    pub(crate) fn delay_value(&self) -> Duration {
        (self.delay)()
    }

    pub(crate) fn next(self) -> Self {
        Self {
            remaining: self.remaining.saturating_sub(1),
            ..self
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}
