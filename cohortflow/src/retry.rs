use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Budget for transient failures such as a failed remote artifact copy.
///
/// `max_attempts` counts every attempt, so the default of 5 means four
/// retries after the first failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransientRetryPolicy {
    /// Maximum number of attempts before the task is failed.
    pub max_attempts: u16,
    /// Fixed delay in milliseconds between attempts.
    pub backoff_ms: u64,
}

impl Default for TransientRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 1000,
        }
    }
}

impl TransientRetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// What to do after a failed attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Try again after `delay`.
    Retry { delay: Duration },
    /// Budget spent; the failure is fatal for the task.
    Exhausted,
}

/// Returns true once `attempts` has reached `max_attempts`.
pub fn should_give_up(attempts: u16, max_attempts: u16) -> bool {
    attempts >= max_attempts
}

/// Per-task attempt accounting. The transient and preemption budgets are
/// counted separately and never borrow from each other.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AttemptLedger {
    /// Attempts started so far.
    pub attempts: u32,
    /// Attempts that ended in a transient failure.
    pub transient_failures: u16,
    /// Attempts that ended because the compute was reclaimed.
    pub preemptions: u16,
}

impl AttemptLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of an attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Record a transient failure and decide whether to retry.
    pub fn record_transient(&mut self, policy: &TransientRetryPolicy) -> RetryDecision {
        self.transient_failures = self.transient_failures.saturating_add(1);
        if should_give_up(self.transient_failures, policy.max_attempts) {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: policy.backoff(),
            }
        }
    }

    /// Record a preemption and decide whether to retry. `max_retries`
    /// preemptions are tolerated; the next one is fatal.
    pub fn record_preemption(&mut self, max_retries: u16) -> RetryDecision {
        self.preemptions = self.preemptions.saturating_add(1);
        if self.preemptions > max_retries {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: Duration::ZERO,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_give_up() {
        assert!(!should_give_up(0, 5));
        assert!(!should_give_up(4, 5));
        assert!(should_give_up(5, 5));
        assert!(should_give_up(6, 5));
    }

    #[test]
    fn test_transient_budget_allows_four_retries() {
        let policy = TransientRetryPolicy::default();
        let mut ledger = AttemptLedger::new();

        for _ in 0..4 {
            assert_eq!(
                ledger.record_transient(&policy),
                RetryDecision::Retry {
                    delay: Duration::from_millis(1000)
                }
            );
        }
        assert_eq!(ledger.record_transient(&policy), RetryDecision::Exhausted);
    }

    #[test]
    fn test_preemption_budget_separate_from_transient() {
        let policy = TransientRetryPolicy {
            max_attempts: 2,
            backoff_ms: 0,
        };
        let mut ledger = AttemptLedger::new();

        assert!(matches!(ledger.record_transient(&policy), RetryDecision::Retry { .. }));
        assert!(matches!(ledger.record_preemption(2), RetryDecision::Retry { .. }));
        assert!(matches!(ledger.record_preemption(2), RetryDecision::Retry { .. }));
        assert_eq!(ledger.record_preemption(2), RetryDecision::Exhausted);
        assert_eq!(ledger.transient_failures, 1);
        assert_eq!(ledger.preemptions, 3);
    }

    #[test]
    fn test_zero_max_retries_fails_on_first_preemption() {
        let mut ledger = AttemptLedger::new();
        assert_eq!(ledger.record_preemption(0), RetryDecision::Exhausted);
    }

    #[test]
    fn test_begin_attempt_counts_from_one() {
        let mut ledger = AttemptLedger::new();
        assert_eq!(ledger.begin_attempt(), 1);
        assert_eq!(ledger.begin_attempt(), 2);
    }
}
