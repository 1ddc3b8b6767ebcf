//! Live retry policy shared between the accessor and the shutdown path
//!
//! The policy is read on every retry decision instead of being copied into
//! each operation. Shutdown calls [`RetryPolicy::disable`], and any retry loop
//! currently backing off observes the zeroed budget on its next poll and gives
//! up. This is cooperative cancellation: a remote call already in flight is
//! not interrupted.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AccessorError;

/// Longest uninterrupted sleep while backing off; the policy is re-read
/// between slices.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Retry budget for failed remote operations.
#[derive(Debug)]
pub struct RetryPolicy {
    time_limit_ns: AtomicU64,
    max_attempts: AtomicU32,
    min_delay_ns: AtomicU64,
    max_delay_ns: AtomicU64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(5 * 60),
            99_999_999 + 1,
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
    }
}

fn to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl RetryPolicy {
    /// `max_attempts` counts every attempt, the first one included.
    pub fn new(
        time_limit: Duration,
        max_attempts: u32,
        min_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            time_limit_ns: AtomicU64::new(to_nanos(time_limit)),
            max_attempts: AtomicU32::new(max_attempts),
            min_delay_ns: AtomicU64::new(to_nanos(min_delay)),
            max_delay_ns: AtomicU64::new(to_nanos(max_delay)),
        }
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_nanos(self.time_limit_ns.load(Ordering::Acquire))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.load(Ordering::Acquire)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_nanos(self.min_delay_ns.load(Ordering::Acquire))
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_nanos(self.max_delay_ns.load(Ordering::Acquire))
    }

    /// Revokes the retry budget. Loops polling this policy stop at their
    /// next check.
    pub fn disable(&self) {
        self.max_attempts.store(0, Ordering::Release);
        self.max_delay_ns.store(0, Ordering::Release);
    }

    pub fn is_disabled(&self) -> bool {
        self.max_attempts() == 0
    }

    /// Starts tracking a new operation against this policy.
    pub fn start_operation(&self) -> RetryOperation<'_> {
        RetryOperation {
            policy: self,
            attempts: 0,
            started: Instant::now(),
        }
    }
}

/// Attempt bookkeeping for one logical remote operation.
#[derive(Debug)]
pub struct RetryOperation<'a> {
    policy: &'a RetryPolicy,
    attempts: u32,
    started: Instant,
}

impl RetryOperation<'_> {
    /// Number of failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records a failed attempt and decides whether to try again, sleeping
    /// for the backoff delay first. Returns `false` when the error is final
    /// or the budget is spent.
    pub async fn should_retry(&mut self, err: &AccessorError) -> bool {
        if !err.is_retryable() {
            return false;
        }
        self.attempts = self.attempts.saturating_add(1);

        let Some(delay) = self.next_delay() else {
            return false;
        };

        let wake_at = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if now >= wake_at {
                break;
            }
            tokio::time::sleep((wake_at - now).min(POLL_INTERVAL)).await;
            if self.next_delay().is_none() {
                return false;
            }
        }

        self.next_delay().is_some()
    }

    /// Backoff before the next attempt, or `None` if no attempt is left.
    fn next_delay(&self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts() {
            return None;
        }
        let elapsed = self.started.elapsed();
        let time_limit = self.policy.time_limit();
        if elapsed >= time_limit {
            return None;
        }

        // First retry happens immediately, then the delay doubles.
        let delay = if self.attempts <= 1 {
            Duration::ZERO
        } else {
            let exponent = (self.attempts - 2).min(30);
            self.policy
                .min_delay()
                .saturating_mul(1u32 << exponent)
                .min(self.policy.max_delay())
        };

        Some(delay.min(time_limit - elapsed))
    }
}
