//! Poll interval and failure-visibility policy.
//!
//! The interval starts at the floor, grows by the multiplier on every failed
//! poll up to the ceiling, and snaps back to the floor on success. Failures
//! only become user-visible once `error_threshold` of them happened in a row.

use std::time::Duration;

/// Tunables for [`Backoff`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Interval after a success.
    pub floor: Duration,
    /// Upper bound of the interval.
    pub ceiling: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Consecutive failures before an error is surfaced.
    pub error_threshold: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(10),
            ceiling: Duration::from_secs(90),
            multiplier: 1.8,
            error_threshold: 3,
        }
    }
}

/// Backoff state of one polling loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    interval: Duration,
    failures: u32,
}

impl Backoff {
    /// Starts at the policy floor with no failures.
    #[must_use]
    pub const fn new(policy: BackoffPolicy) -> Self {
        Self {
            interval: policy.floor,
            policy,
            failures: 0,
        }
    }

    /// Records a successful poll and returns the next interval (the floor).
    pub const fn on_success(&mut self) -> Duration {
        self.failures = 0;
        self.interval = self.policy.floor;
        self.interval
    }

    /// Records a failed poll and returns the grown interval.
    pub fn on_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let grown = self.interval.mul_f64(self.policy.multiplier.max(1.0));
        self.interval = grown.min(self.policy.ceiling);
        self.interval
    }

    /// Returns `true` once the consecutive failure count reaches the threshold.
    #[must_use]
    pub const fn should_surface(&self) -> bool {
        self.failures >= self.policy.error_threshold
    }

    /// Current interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of failures since the last success.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.failures
    }
}
