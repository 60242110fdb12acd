//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the publishing pipeline:
//!
//! - `Job`: A unit of work to be executed by workers
//! - `PublishTask`: Snapshot of the agendamento content a job publishes
//! - `RetryPolicy`: Exponential backoff applied between attempts
//! - `JobOutcome`: What a worker did with a leased job

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agendamento::{Agendamento, Platform, PostPayload};

/// Default maximum number of attempts for a job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What a job publishes.
///
/// The agendamento record remains the system of record; this is the
/// translation the loader hands to the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishTask {
    /// Agendamento this task was created from (lookup only).
    pub agendamento_id: Uuid,
    /// Platform integration to call.
    pub platform: Platform,
    /// Content to publish.
    pub payload: PostPayload,
}

impl PublishTask {
    /// Builds the task for an agendamento.
    pub fn from_agendamento(agendamento: &Agendamento) -> Self {
        Self {
            agendamento_id: agendamento.id,
            platform: agendamento.target_platform,
            payload: agendamento.payload.clone(),
        }
    }

    /// Key sent to the platform so a replayed attempt can be recognised.
    pub fn idempotency_key(&self) -> String {
        format!("agendamento-{}", self.agendamento_id)
    }
}

/// A job representing one agendamento waiting to be published.
///
/// Timestamps are stored as epoch milliseconds so the Redis scripts can
/// compare them without decoding dates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: Uuid,
    /// The task to execute.
    pub task: PublishTask,
    /// When this job was first enqueued.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,
    /// The job is not leased before this time.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub available_at: DateTime<Utc>,
    /// Expiry of the current lease, set when the job is leased.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Token of the current lease. Only the holder can ack or retry the job.
    #[serde(skip)]
    pub lease_token: Option<Uuid>,
    /// Number of failed attempts so far.
    pub retry_count: u32,
    /// Attempts allowed before the job is dead-lettered.
    pub max_retries: u32,
    /// Error that caused the latest retry.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Job {
    /// Creates a job that is eligible immediately.
    pub fn new(task: PublishTask) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task,
            enqueued_at: now,
            available_at: now,
            lease_expires_at: None,
            lease_token: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delays the first lease until `at`.
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = at;
        self
    }

    /// Agendamento this job publishes.
    pub fn agendamento_id(&self) -> Uuid {
        self.task.agendamento_id
    }

    /// Returns whether another failure would still be retried.
    pub fn should_retry(&self) -> bool {
        self.retry_count + 1 < self.max_retries
    }

    /// Returns the number of attempts left, the current one included.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Returns whether the lease has lapsed at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|expiry| expiry <= now)
    }

    /// Returns a copy prepared for the next attempt.
    pub(crate) fn next_attempt(&self, error: &str, available_at: DateTime<Utc>) -> Job {
        let mut next = self.clone();
        next.retry_count += 1;
        next.available_at = available_at;
        next.last_error = Some(error.to_string());
        next.lease_expires_at = None;
        next.lease_token = None;
        next
    }
}

/// Exponential backoff between attempts: `base * 2^retry_count`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
        }
    }

    /// Delay before the attempt following `retry_count` failures.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What a worker did with a leased job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The post went live and the job was acknowledged.
    Published {
        job_id: Uuid,
        agendamento_id: Uuid,
        external_post_id: String,
    },
    /// The attempt failed and the job was rescheduled.
    Retrying {
        job_id: Uuid,
        agendamento_id: Uuid,
        retry_count: u32,
        delay_ms: u64,
        error: String,
    },
    /// The attempt failed and no attempts remain.
    DeadLettered {
        job_id: Uuid,
        agendamento_id: Uuid,
        error: String,
    },
    /// The agendamento was already handled, the job was acknowledged.
    Skipped {
        job_id: Uuid,
        agendamento_id: Uuid,
        reason: String,
    },
    /// The lease was lost before the result could be recorded.
    LeaseLost { job_id: Uuid, agendamento_id: Uuid },
}

impl JobOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobOutcome::Published { job_id, .. }
            | JobOutcome::Retrying { job_id, .. }
            | JobOutcome::DeadLettered { job_id, .. }
            | JobOutcome::Skipped { job_id, .. }
            | JobOutcome::LeaseLost { job_id, .. } => *job_id,
        }
    }

    /// Label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Published { .. } => "published",
            JobOutcome::Retrying { .. } => "retrying",
            JobOutcome::DeadLettered { .. } => "dead_lettered",
            JobOutcome::Skipped { .. } => "skipped",
            JobOutcome::LeaseLost { .. } => "lease_lost",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Published { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agendamento::MediaRef;

    fn create_test_task() -> PublishTask {
        PublishTask {
            agendamento_id: Uuid::new_v4(),
            platform: Platform::Instagram,
            payload: PostPayload::new("caption").with_media(MediaRef::image("https://x/y.jpg")),
        }
    }

    #[test]
    fn test_job_new() {
        let job = Job::new(create_test_task());

        assert!(!job.id.is_nil());
        assert_ne!(job.id, job.agendamento_id());
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert!(job.lease_token.is_none());
        assert!(job.should_retry());
    }

    #[test]
    fn test_should_retry_counts_attempts() {
        let mut job = Job::new(create_test_task()).with_max_retries(3);

        assert!(job.should_retry());
        assert_eq!(job.remaining_attempts(), 3);

        job = job.next_attempt("boom", Utc::now());
        assert!(job.should_retry());
        assert_eq!(job.retry_count, 1);

        job = job.next_attempt("boom", Utc::now());
        // A third failure exhausts the budget.
        assert!(!job.should_retry());
        assert_eq!(job.remaining_attempts(), 1);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_lease_expired() {
        let now = Utc::now();
        let mut job = Job::new(create_test_task());
        assert!(!job.lease_expired(now));

        job.lease_expires_at = Some(now + chrono::Duration::seconds(30));
        assert!(!job.lease_expired(now));
        assert!(job.lease_expired(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_lease_token_not_serialized() {
        let mut job = Job::new(create_test_task());
        job.lease_token = Some(Uuid::new_v4());
        job.lease_expires_at = Some(Utc::now());

        let json = serde_json::to_string(&job).expect("serialization should work");
        assert!(!json.contains("lease_token"));

        let parsed: Job = serde_json::from_str(&json).expect("deserialization should work");
        assert!(parsed.lease_token.is_none());
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.task, job.task);
        assert_eq!(
            parsed.available_at.timestamp_millis(),
            job.available_at.timestamp_millis()
        );
    }

    #[test]
    fn test_timestamps_are_epoch_millis() {
        let job = Job::new(create_test_task());
        let value = serde_json::to_value(&job).expect("serialization should work");

        assert!(value["available_at"].is_i64());
        assert!(value["lease_expires_at"].is_null());
    }

    #[test]
    fn test_retry_policy_exponential_and_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(100), 5);

        assert_eq!(policy.delay_for(0), Duration::from_secs(10));
        assert_eq!(policy.delay_for(1), Duration::from_secs(20));
        assert_eq!(policy.delay_for(2), Duration::from_secs(40));
        assert_eq!(policy.delay_for(3), Duration::from_secs(80));
        assert_eq!(policy.delay_for(4), Duration::from_secs(100));
        assert_eq!(policy.delay_for(40), Duration::from_secs(100));
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let task = create_test_task();
        assert_eq!(task.idempotency_key(), task.clone().idempotency_key());
        assert!(task
            .idempotency_key()
            .ends_with(&task.agendamento_id.to_string()));
    }

    #[test]
    fn test_outcome_labels() {
        let outcome = JobOutcome::LeaseLost {
            job_id: Uuid::new_v4(),
            agendamento_id: Uuid::new_v4(),
        };
        assert_eq!(outcome.label(), "lease_lost");
        assert!(!outcome.is_success());
    }
}
