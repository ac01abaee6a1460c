//! Job Records
//!
//! A job is durable, retryable deferred work: an async continuation, a timer
//! firing, or a custom message handled by a registered [`JobHandler`].
//!
//! [`JobHandler`]: super::JobHandler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::ExecutionRef;
use crate::store::Entity;

/// Handler type of async continuation jobs.
pub const ASYNC_CONTINUATION: &str = "async-continuation";

/// Handler type of timer jobs.
pub const TIMER_TRIGGER: &str = "trigger-timer";

/// Broad category of a job.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    AsyncContinuation,
    Timer,
    Message,
}

/// Observable state, derived from the record and the current time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Timer whose due date lies in the future
    Scheduled,
    /// Eligible for acquisition
    Pending,
    /// Locked by a worker
    Claimed,
    /// Retries exhausted; kept for inspection only
    Dead,
}

/// Side of a node an async continuation resumes on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AsyncPhase {
    Before,
    After,
}

/// A durable unit of deferred work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub revision: u64,
    pub kind: JobKind,
    pub handler_type: String,
    #[serde(default)]
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_definition_id: Option<String>,

    /// None means eligible immediately
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expiration: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a job that is due immediately.
    pub fn new(
        id: impl Into<String>,
        kind: JobKind,
        handler_type: impl Into<String>,
        payload: Value,
        retries: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            revision: 0,
            kind,
            handler_type: handler_type.into(),
            payload,
            execution_id: None,
            process_instance_id: None,
            process_definition_id: None,
            due_date: None,
            retries,
            exception_message: None,
            lock_owner: None,
            lock_expiration: None,
            created_at,
        }
    }

    /// Binds the job to an execution.
    pub fn for_execution(mut self, target: &ExecutionRef, process_definition_id: impl Into<String>) -> Self {
        self.execution_id = Some(target.execution_id.clone());
        self.process_instance_id = Some(target.process_instance_id.clone());
        self.process_definition_id = Some(process_definition_id.into());
        self
    }

    pub fn due_at(mut self, due: DateTime<Utc>) -> Self {
        self.due_date = Some(due);
        self
    }

    /// The execution this job resumes, when it has one.
    pub fn target(&self) -> Option<ExecutionRef> {
        match (&self.process_instance_id, &self.execution_id) {
            (Some(pi), Some(execution)) => Some(ExecutionRef::new(pi, execution)),
            _ => None,
        }
    }

    /// Retries exhausted after a recorded failure.
    pub fn is_dead(&self) -> bool {
        self.retries == 0 && self.exception_message.is_some()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.map_or(true, |due| due <= now)
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration.map_or(false, |expires| expires > now)
    }

    /// Due, retries left, and not held by a live lock.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.retries > 0 && self.is_due(now) && !self.is_locked(now)
    }

    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if self.is_dead() || self.retries == 0 {
            JobState::Dead
        } else if self.is_locked(now) {
            JobState::Claimed
        } else if !self.is_due(now) {
            JobState::Scheduled
        } else {
            JobState::Pending
        }
    }

    pub fn lock(&mut self, owner: impl Into<String>, until: DateTime<Utc>) {
        self.lock_owner = Some(owner.into());
        self.lock_expiration = Some(until);
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration = None;
    }

    /// Ordering key for acquisition: due date (or creation time), then id.
    pub(crate) fn acquisition_key(&self) -> (DateTime<Utc>, usize, String) {
        (
            self.due_date.unwrap_or(self.created_at),
            self.id.len(),
            self.id.clone(),
        )
    }

    /// Node id carried in a continuation or timer payload.
    pub fn activity_id(&self) -> Option<&str> {
        self.payload.get("activity").and_then(Value::as_str)
    }

    /// Phase carried in an async continuation payload.
    pub fn async_phase(&self) -> Option<AsyncPhase> {
        match self.payload.get("phase").and_then(Value::as_str) {
            Some("before") => Some(AsyncPhase::Before),
            Some("after") => Some(AsyncPhase::After),
            _ => None,
        }
    }
}

impl Entity for Job {
    const KIND: &'static str = "job";

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

/// Result of one job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded; the job is gone
    Completed,
    /// Handler failed and the job will be retried
    Failed { retries_left: u32 },
    /// Handler failed for the last time
    Dead,
    /// Missing or already-dead job; nothing happened
    Skipped,
    /// Another worker changed the same state first; the lock was released
    Conflict,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn job(now: DateTime<Utc>) -> Job {
        Job::new("1", JobKind::Message, "mail", json!({}), 3, now)
    }

    #[test]
    fn test_state_transitions() {
        let now = Utc::now();
        let mut job = job(now);
        assert_eq!(job.state(now), JobState::Pending);

        job.lock("worker", now + Duration::minutes(5));
        assert_eq!(job.state(now), JobState::Claimed);
        assert!(!job.is_acquirable(now));

        // Abandoned claim
        assert!(job.is_acquirable(now + Duration::minutes(6)));

        job.unlock();
        job.retries = 0;
        job.exception_message = Some("boom".to_string());
        assert!(job.is_dead());
        assert_eq!(job.state(now), JobState::Dead);
        assert!(!job.is_acquirable(now));
    }

    #[test]
    fn test_timer_eligibility() {
        let now = Utc::now();
        let job = job(now).due_at(now + Duration::seconds(10));

        assert_eq!(job.state(now), JobState::Scheduled);
        assert!(!job.is_acquirable(now));
        assert!(job.is_acquirable(now + Duration::seconds(10)));
    }

    #[test]
    fn test_payload_accessors() {
        let now = Utc::now();
        let mut job = job(now);
        job.payload = json!({"activity": "review", "phase": "after"});

        assert_eq!(job.activity_id(), Some("review"));
        assert_eq!(job.async_phase(), Some(AsyncPhase::After));
    }

    #[test]
    fn test_target_requires_execution() {
        let now = Utc::now();
        let standalone = job(now);
        assert!(standalone.target().is_none());

        let bound = job(now).for_execution(&ExecutionRef::new("1", "4"), "order");
        assert_eq!(bound.target(), Some(ExecutionRef::new("1", "4")));
        assert_eq!(bound.process_definition_id.as_deref(), Some("order"));
    }

    #[test]
    fn test_acquisition_order_is_numeric_by_id() {
        let now = Utc::now();
        let mut a = job(now);
        a.id = "9".to_string();
        let mut b = job(now);
        b.id = "10".to_string();

        assert!(a.acquisition_key() < b.acquisition_key());
    }
}
