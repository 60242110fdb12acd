//! Storage backends for the job queue.
//!
//! Each primitive is atomic on its store. Callers never read-modify-write job
//! state themselves; the lease token passed to `ack`, `reschedule` and `bury`
//! is checked by the backend in the same atomic step as the mutation.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::job::Job;
use super::queue::{DeadLetter, QueueError, QueueStats};

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Atomic queue primitives over a shared store.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Adds a job to the ready set.
    ///
    /// Returns the id of the live job for the agendamento, which is the
    /// existing one if the agendamento is already queued.
    async fn push(&self, queue: &str, job: &Job) -> Result<Uuid, QueueError>;

    /// Reclaims expired leases, then leases the earliest eligible job.
    ///
    /// The returned job carries its lease token and expiry.
    async fn lease(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<Job>, QueueError>;

    /// Removes a leased job. Returns `false` if `token` is not its lease.
    async fn ack(&self, queue: &str, job: &Job, token: Uuid) -> Result<bool, QueueError>;

    /// Stores the updated job and returns it to the ready set at its
    /// `available_at`. Returns `false` if `token` is not its lease.
    async fn reschedule(&self, queue: &str, job: &Job, token: Uuid) -> Result<bool, QueueError>;

    /// Moves a leased job to the dead letter set. Returns `false` if `token`
    /// is not its lease.
    async fn bury(&self, queue: &str, entry: &DeadLetter, token: Uuid)
        -> Result<bool, QueueError>;

    /// Returns expired leases to the ready set and reports how many.
    async fn reclaim_expired(&self, queue: &str, now: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Counts jobs per set.
    async fn stats(&self, queue: &str, now: DateTime<Utc>) -> Result<QueueStats, QueueError>;

    /// Returns up to `limit` dead letters, newest first.
    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    /// Deletes every set of the queue.
    async fn clear(&self, queue: &str) -> Result<(), QueueError>;
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, lease_duration: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease_duration).unwrap_or_else(|_| chrono::Duration::days(1))
}
