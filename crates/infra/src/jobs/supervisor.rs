//! Retry/backoff decisions for failed job attempts.

use std::time::Duration;

use tablesync_core::{RetryPolicy, SyncError, SyncJob};

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the job after `delay`.
    Retry { delay: Duration },
    /// Fail the job permanently with `error`.
    Fail { error: String },
}

/// Decides between retry and permanent failure.
///
/// Only transient source errors are retried, and only while the job has
/// attempts left; its own `max_attempts` bounds the count, the policy
/// supplies the backoff.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    policy: RetryPolicy,
}

impl Supervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn decide(&self, job: &SyncJob, err: &SyncError) -> RetryDecision {
        let attempts_made = job.attempt();

        if !err.is_transient() {
            return RetryDecision::Fail {
                error: err.to_string(),
            };
        }

        if attempts_made < job.max_attempts {
            RetryDecision::Retry {
                delay: self.policy.delay_for_attempt(attempts_made),
            }
        } else {
            RetryDecision::Fail {
                error: format!("retries exhausted after {attempts_made} attempts: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_core::{SyncRequest, TableId};

    fn job(retries: u32, max_attempts: u32) -> SyncJob {
        let mut job = SyncJob::new(TableId::new(), &SyncRequest::full("orders", "sales"), max_attempts);
        job.retries = retries;
        job
    }

    fn supervisor() -> Supervisor {
        Supervisor::new(RetryPolicy::fixed(3, Duration::from_millis(10)))
    }

    #[test]
    fn transient_errors_retry_until_bound() {
        let err = SyncError::transient("connection reset");

        assert_eq!(
            supervisor().decide(&job(0, 3), &err),
            RetryDecision::Retry {
                delay: Duration::from_millis(10)
            }
        );
        assert!(matches!(supervisor().decide(&job(1, 3), &err), RetryDecision::Retry { .. }));

        match supervisor().decide(&job(2, 3), &err) {
            RetryDecision::Fail { error } => {
                assert!(error.starts_with("retries exhausted after 3 attempts"));
                assert!(error.contains("connection reset"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn logical_and_internal_errors_fail_immediately() {
        for err in [SyncError::logical("bad sql"), SyncError::internal("disk full")] {
            match supervisor().decide(&job(0, 3), &err) {
                RetryDecision::Fail { error } => {
                    assert_eq!(error, err.to_string());
                    assert!(!error.contains("retries exhausted"));
                }
                other => panic!("expected failure, got {other:?}"),
            }
        }
    }

    #[test]
    fn single_attempt_jobs_never_retry() {
        let err = SyncError::transient("timeout");
        assert!(matches!(supervisor().decide(&job(0, 1), &err), RetryDecision::Fail { .. }));
    }
}
