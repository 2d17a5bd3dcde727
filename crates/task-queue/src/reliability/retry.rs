//! Retry policy implementation

use serde::{Deserialize, Serialize};

/// Decision taken after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the task back to pending, immediately claimable
    Retry,

    /// Give up; the task becomes failed
    Fail,
}

/// Configuration for task retries
///
/// Retries are counted, not delayed: a task that fails is claimable again as
/// soon as the queue polls. Processors that want a pause call `reschedule`.
///
/// # Example
///
/// ```
/// use shelfsync_task_queue::reliability::{RetryDecision, RetryPolicy};
///
/// let policy = RetryPolicy::new(3);
///
/// // After the first and second failure the task is retried
/// assert_eq!(policy.decide(1), RetryDecision::Retry);
/// assert_eq!(policy.decide(2), RetryDecision::Retry);
/// // The third failure is final
/// assert_eq!(policy.decide(3), RetryDecision::Fail);
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of failed attempts after which a task is failed
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl RetryPolicy {
    /// Create a policy allowing `max_retries` failed attempts
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Create a policy that fails a task on its first error
    pub fn no_retry() -> Self {
        Self { max_retries: 1 }
    }

    /// Decide what happens once a task has failed `retries` times
    pub fn decide(&self, retries: i32) -> RetryDecision {
        if self.is_exhausted(retries) {
            RetryDecision::Fail
        } else {
            RetryDecision::Retry
        }
    }

    /// Whether `retries` failures exhaust the policy
    pub fn is_exhausted(&self, retries: i32) -> bool {
        i64::from(retries) >= i64::from(self.max_retries)
    }

    /// Whether a task with `retries` failures may still be claimed
    pub fn allows_claim(&self, retries: i32) -> bool {
        !self.is_exhausted(retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        assert_eq!(RetryPolicy::default().max_retries, 3);
    }

    #[test]
    fn test_last_allowed_failure_is_final() {
        let policy = RetryPolicy::new(5);
        for retries in 1..5 {
            assert_eq!(policy.decide(retries), RetryDecision::Retry);
        }
        assert_eq!(policy.decide(5), RetryDecision::Fail);
        assert_eq!(policy.decide(6), RetryDecision::Fail);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert!(policy.allows_claim(0));
        assert_eq!(policy.decide(1), RetryDecision::Fail);
        assert!(!policy.allows_claim(1));
    }

    #[test]
    fn test_claim_eligibility_matches_decision() {
        let policy = RetryPolicy::new(2);
        assert!(policy.allows_claim(0));
        assert!(policy.allows_claim(1));
        assert!(!policy.allows_claim(2));
    }
}
