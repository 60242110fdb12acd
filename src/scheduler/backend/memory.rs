//! In-process queue backend.
//!
//! A single mutex guards all queues, so every primitive is atomic with respect
//! to the others. Jobs are lost when the process exits; use it for tests and
//! single-process deployments.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{lease_expiry, QueueBackend};
use crate::scheduler::job::Job;
use crate::scheduler::queue::{DeadLetter, QueueError, QueueStats};

/// Ordering key of the ready set: eligibility time, then enqueue sequence.
type ReadyKey = (i64, u64);

#[derive(Debug)]
struct ActiveLease {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    next_seq: u64,
    jobs: HashMap<Uuid, Job>,
    seqs: HashMap<Uuid, u64>,
    ready: BTreeMap<ReadyKey, Uuid>,
    leased: HashMap<Uuid, ActiveLease>,
    refs: HashMap<Uuid, Uuid>,
    dead: VecDeque<DeadLetter>,
}

impl MemoryQueue {
    fn make_ready(&mut self, job_id: Uuid) {
        if let (Some(job), Some(seq)) = (self.jobs.get(&job_id), self.seqs.get(&job_id)) {
            self.ready
                .insert((job.available_at.timestamp_millis(), *seq), job_id);
        }
    }

    fn reclaim(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Uuid> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.leased.remove(id);
            self.make_ready(*id);
        }

        expired.len()
    }

    fn holds_lease(&self, job_id: Uuid, token: Uuid) -> bool {
        self.leased
            .get(&job_id)
            .is_some_and(|lease| lease.token == token)
    }

    fn forget(&mut self, job: &Job) {
        self.jobs.remove(&job.id);
        self.seqs.remove(&job.id);
        self.leased.remove(&job.id);
        if self.refs.get(&job.agendamento_id()) == Some(&job.id) {
            self.refs.remove(&job.agendamento_id());
        }
    }
}

/// Queue backend kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    queues: Mutex<HashMap<String, MemoryQueue>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn push(&self, queue: &str, job: &Job) -> Result<Uuid, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        if let Some(existing) = state.refs.get(&job.agendamento_id()) {
            return Ok(*existing);
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        state.jobs.insert(job.id, job.clone());
        state.seqs.insert(job.id, seq);
        state.refs.insert(job.agendamento_id(), job.id);
        state.make_ready(job.id);

        Ok(job.id)
    }

    async fn lease(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        state.reclaim(now);

        let now_ms = now.timestamp_millis();
        loop {
            let next = match state.ready.first_key_value() {
                Some((key, _)) if key.0 <= now_ms => *key,
                _ => return Ok(None),
            };
            let Some(job_id) = state.ready.remove(&next) else {
                return Ok(None);
            };
            // Entries without a job are dropped; the next one may still be eligible.
            let Some(stored) = state.jobs.get(&job_id) else {
                state.seqs.remove(&job_id);
                continue;
            };

            let token = Uuid::new_v4();
            let expires_at = lease_expiry(now, lease_duration);
            state
                .leased
                .insert(job_id, ActiveLease { token, expires_at });

            let mut job = stored.clone();
            job.lease_token = Some(token);
            job.lease_expires_at = Some(expires_at);
            return Ok(Some(job));
        }
    }

    async fn ack(&self, queue: &str, job: &Job, token: Uuid) -> Result<bool, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };

        if !state.holds_lease(job.id, token) {
            return Ok(false);
        }

        state.forget(job);
        Ok(true)
    }

    async fn reschedule(&self, queue: &str, job: &Job, token: Uuid) -> Result<bool, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };

        if !state.holds_lease(job.id, token) {
            return Ok(false);
        }

        state.leased.remove(&job.id);
        state.jobs.insert(job.id, job.clone());
        state.make_ready(job.id);
        Ok(true)
    }

    async fn bury(
        &self,
        queue: &str,
        entry: &DeadLetter,
        token: Uuid,
    ) -> Result<bool, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };

        if !state.holds_lease(entry.job.id, token) {
            return Ok(false);
        }

        state.forget(&entry.job);
        state.dead.push_front(entry.clone());
        Ok(true)
    }

    async fn reclaim_expired(&self, queue: &str, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut queues = self.queues.lock().await;
        Ok(queues
            .get_mut(queue)
            .map(|state| state.reclaim(now))
            .unwrap_or(0))
    }

    async fn stats(&self, queue: &str, now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
        let queues = self.queues.lock().await;
        let mut stats = QueueStats {
            queue_name: queue.to_string(),
            ..Default::default()
        };

        if let Some(state) = queues.get(queue) {
            let now_ms = now.timestamp_millis();
            stats.ready_jobs = state.ready.keys().filter(|key| key.0 <= now_ms).count();
            stats.delayed_jobs = state.ready.len() - stats.ready_jobs;
            stats.leased_jobs = state.leased.len();
            stats.dead_letter_jobs = state.dead.len();
        }

        Ok(stats)
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|state| state.dead.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, queue: &str) -> Result<(), QueueError> {
        self.queues.lock().await.remove(queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agendamento::{Platform, PostPayload};
    use crate::scheduler::job::PublishTask;

    fn job() -> Job {
        Job::new(PublishTask {
            agendamento_id: Uuid::new_v4(),
            platform: Platform::Instagram,
            payload: PostPayload::new("memory"),
        })
    }

    #[tokio::test]
    async fn test_queues_are_isolated_by_name() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        backend.push("a", &job()).await.expect("push");

        assert!(backend
            .lease("b", now, Duration::from_secs(5))
            .await
            .expect("lease")
            .is_none());
        assert!(backend
            .lease("a", now, Duration::from_secs(5))
            .await
            .expect("lease")
            .is_some());
    }

    #[tokio::test]
    async fn test_lease_skips_entry_without_job() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let orphan = job();
        let live = job();
        backend.push("q", &orphan).await.expect("push");
        backend.push("q", &live).await.expect("push");

        backend
            .queues
            .lock()
            .await
            .get_mut("q")
            .expect("queue")
            .jobs
            .remove(&orphan.id);

        let leased = backend
            .lease("q", now, Duration::from_secs(5))
            .await
            .expect("lease")
            .expect("live job behind the orphan");
        assert_eq!(leased.id, live.id);
    }

    #[tokio::test]
    async fn test_future_job_not_leased_early() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let delayed = job().not_before(now + chrono::Duration::minutes(10));
        backend.push("q", &delayed).await.expect("push");

        assert!(backend
            .lease("q", now, Duration::from_secs(5))
            .await
            .expect("lease")
            .is_none());

        let later = now + chrono::Duration::minutes(11);
        let leased = backend
            .lease("q", later, Duration::from_secs(5))
            .await
            .expect("lease")
            .expect("eligible");
        assert_eq!(leased.id, delayed.id);
    }

    #[tokio::test]
    async fn test_reclaim_counts_expired_only() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        backend.push("q", &job()).await.expect("push");
        backend.push("q", &job()).await.expect("push");

        backend
            .lease("q", now, Duration::from_secs(1))
            .await
            .expect("lease");
        backend
            .lease("q", now, Duration::from_secs(60))
            .await
            .expect("lease");

        let reclaimed = backend
            .reclaim_expired("q", now + chrono::Duration::seconds(2))
            .await
            .expect("reclaim");
        assert_eq!(reclaimed, 1);

        let stats = backend
            .stats("q", now + chrono::Duration::seconds(2))
            .await
            .expect("stats");
        assert_eq!(stats.ready_jobs, 1);
        assert_eq!(stats.leased_jobs, 1);
    }
}
