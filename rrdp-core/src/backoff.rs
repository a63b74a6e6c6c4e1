//! Per-repository failure backoff.
//!
//! Backoff is plain data owned by the scheduler's slot for a repository;
//! each cycle outcome drives one transition.

use std::time::Duration;

use crate::error::FailureKind;
use crate::outcome::CycleResult;

/// Cadence and cap shared by all repositories of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Nominal delay between cycles of one repository.
    pub interval: Duration,
    /// Upper bound for the delay after repeated failures.
    pub max_backoff: Duration,
}

impl BackoffPolicy {
    pub fn new(interval: Duration, max_backoff: Duration) -> Self {
        Self {
            interval,
            max_backoff: max_backoff.max(interval),
        }
    }

    /// Delay after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.interval;
        }
        let mut delay = self.interval;
        for _ in 0..failures {
            delay = next_backoff(delay, self.max_backoff);
            if delay >= self.max_backoff {
                break;
            }
        }
        delay
    }
}

/// Backoff record of one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryBackoff {
    pub consecutive_failures: u32,
    pub current_delay: Duration,
}

impl RepositoryBackoff {
    pub fn new(policy: &BackoffPolicy) -> Self {
        Self {
            consecutive_failures: 0,
            current_delay: policy.interval,
        }
    }

    /// Record a cycle result and return the delay until the next attempt.
    ///
    /// Success resets to the nominal interval. A failure doubles the delay
    /// up to the cap. A persistence failure leaves everything unchanged:
    /// the fetched data was valid, so the next tick simply retries.
    pub fn on_outcome(&mut self, result: &CycleResult, policy: &BackoffPolicy) -> Duration {
        match result.failure_kind() {
            None => {
                self.consecutive_failures = 0;
                self.current_delay = policy.interval;
            }
            Some(FailureKind::PersistenceError) => {}
            Some(_) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.current_delay = policy.delay_for(self.consecutive_failures);
            }
        }
        self.current_delay
    }

    pub fn is_backing_off(&self) -> bool {
        self.consecutive_failures > 0
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }
    current.saturating_mul(2).min(max_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(600))
    }

    fn failed(kind: FailureKind) -> CycleResult {
        CycleResult::Failed(FailureReason::new(kind, "boom"))
    }

    #[test]
    fn test_exponential_with_cap() {
        let policy = policy();
        let mut backoff = RepositoryBackoff::new(&policy);
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.on_outcome(&failed(FailureKind::FetchError), &policy).as_secs())
            .collect();
        assert_eq!(delays, vec![120, 240, 480, 600, 600, 600]);
        assert_eq!(backoff.consecutive_failures, 6);
    }

    #[test]
    fn test_success_resets() {
        let policy = policy();
        let mut backoff = RepositoryBackoff::new(&policy);
        backoff.on_outcome(&failed(FailureKind::Timeout), &policy);
        backoff.on_outcome(&failed(FailureKind::HashMismatch), &policy);
        assert!(backoff.is_backing_off());

        let delay = backoff.on_outcome(&CycleResult::NoChange, &policy);
        assert_eq!(delay, Duration::from_secs(60));
        assert_eq!(backoff, RepositoryBackoff::new(&policy));
    }

    #[test]
    fn test_persistence_failure_keeps_delay() {
        let policy = policy();
        let mut backoff = RepositoryBackoff::new(&policy);
        assert_eq!(
            backoff.on_outcome(&failed(FailureKind::PersistenceError), &policy),
            Duration::from_secs(60)
        );
        assert_eq!(backoff.consecutive_failures, 0);

        backoff.on_outcome(&failed(FailureKind::ParseError), &policy);
        let before = backoff;
        backoff.on_outcome(&failed(FailureKind::PersistenceError), &policy);
        assert_eq!(backoff, before);
    }

    #[test]
    fn test_policy_cap_never_below_interval() {
        let policy = BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(10));
        assert_eq!(policy.max_backoff, Duration::from_secs(60));
        assert_eq!(policy.delay_for(5), Duration::from_secs(60));
    }

    #[test]
    fn test_huge_failure_count_does_not_overflow() {
        let policy = policy();
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(600));
    }
}
