//! Retry Policy
//!
//! Decides what a failed job looks like afterwards. The default takes exactly
//! one retry per failed attempt and makes the job eligible again at once;
//! implementations can add backoff by moving the due date.

use chrono::{DateTime, Duration, Utc};

use super::model::Job;

/// Applied to a job after its handler failed.
pub trait RetryPolicy: Send + Sync {
    fn on_failure(&self, job: &mut Job, error: &str, now: DateTime<Utc>);
}

/// Decrement by one, record the error, release the lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecrementRetries;

impl RetryPolicy for DecrementRetries {
    fn on_failure(&self, job: &mut Job, error: &str, _now: DateTime<Utc>) {
        job.retries = job.retries.saturating_sub(1);
        job.exception_message = Some(error.to_string());
        job.unlock();
    }
}

/// Decrement by one and push the due date back by a fixed delay.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    pub delay: Duration,
}

impl RetryPolicy for FixedBackoff {
    fn on_failure(&self, job: &mut Job, error: &str, now: DateTime<Utc>) {
        DecrementRetries.on_failure(job, error, now);
        if job.retries > 0 {
            job.due_date = Some(now.checked_add_signed(self.delay).unwrap_or(DateTime::<Utc>::MAX_UTC));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::JobKind;
    use serde_json::json;

    #[test]
    fn test_decrement_exactly_one() {
        let now = Utc::now();
        let mut job = Job::new("1", JobKind::Message, "x", json!(null), 3, now);
        job.lock("w", now + Duration::minutes(1));

        DecrementRetries.on_failure(&mut job, "boom", now);

        assert_eq!(job.retries, 2);
        assert_eq!(job.exception_message.as_deref(), Some("boom"));
        assert!(job.lock_owner.is_none());
        assert!(!job.is_dead());
    }

    #[test]
    fn test_never_below_zero() {
        let now = Utc::now();
        let mut job = Job::new("1", JobKind::Message, "x", json!(null), 0, now);
        DecrementRetries.on_failure(&mut job, "again", now);
        assert_eq!(job.retries, 0);
        assert!(job.is_dead());
    }

    #[test]
    fn test_fixed_backoff_moves_due_date() {
        let now = Utc::now();
        let policy = FixedBackoff {
            delay: Duration::seconds(30),
        };
        let mut job = Job::new("1", JobKind::Message, "x", json!(null), 2, now);

        policy.on_failure(&mut job, "slow", now);
        assert_eq!(job.due_date, Some(now + Duration::seconds(30)));

        policy.on_failure(&mut job, "slow", now);
        assert!(job.is_dead());
    }

    #[test]
    fn test_backoff_beyond_calendar_saturates() {
        let now = Utc::now();
        let policy = FixedBackoff {
            delay: Duration::milliseconds(i64::MAX),
        };
        let mut job = Job::new("1", JobKind::Message, "x", json!(null), 3, now);

        policy.on_failure(&mut job, "slow", now);
        assert_eq!(job.due_date, Some(DateTime::<Utc>::MAX_UTC));
        assert_eq!(job.retries, 2);
    }
}
