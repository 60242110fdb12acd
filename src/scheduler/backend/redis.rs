//! Redis queue backend.
//!
//! # Key layout
//!
//! For a queue named `{q}`:
//!
//! - `{q}:jobs`: hash, job id -> job JSON
//! - `{q}:ready`: sorted set of ready members scored by eligibility time
//!   (epoch ms). Members are `{seq:020}|{job id}` so equal scores fall back to
//!   enqueue order.
//! - `{q}:members`: hash, job id -> its ready-set member
//! - `{q}:leased`: sorted set of leased job ids scored by lease expiry
//! - `{q}:leases`: hash, job id -> `{token}|{eligibility ms}`
//! - `{q}:refs`: hash, agendamento id -> live job id
//! - `{q}:seq`: enqueue sequence counter
//! - `{q}:dead_letter`: list of dead letter entries, newest first
//!
//! Every mutation runs as a Lua script, so it is atomic on the server and
//! concurrent workers never observe a half-applied lease.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, RedisError, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{lease_expiry, QueueBackend};
use crate::config::ConnectionConfig;
use crate::scheduler::job::Job;
use crate::scheduler::queue::{DeadLetter, QueueError, QueueStats};

/// Returns expired leases to the ready set. Leaves the count in `reclaimed`.
///
/// KEYS: ready, leased, leases, members. ARGV[1]: now (ms).
const RECLAIM_LUA: &str = r#"
local reclaimed = 0
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  local lease = redis.call('HGET', KEYS[3], id)
  redis.call('ZREM', KEYS[2], id)
  redis.call('HDEL', KEYS[3], id)
  local member = redis.call('HGET', KEYS[4], id)
  if member then
    local score = ARGV[1]
    if lease then
      score = string.sub(lease, 38)
    end
    redis.call('ZADD', KEYS[1], score, member)
    reclaimed = reclaimed + 1
  end
end
"#;

/// Leases the earliest eligible job. Members whose job body is gone are
/// dropped and the next member is tried.
///
/// KEYS: ready, leased, leases, members, jobs.
/// ARGV: now (ms), lease expiry (ms), lease token.
const LEASE_LUA: &str = r#"
while true do
  local head = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'WITHSCORES', 'LIMIT', 0, 1)
  if #head == 0 then
    return false
  end
  local member = head[1]
  local score = head[2]
  local id = string.sub(member, 22)
  redis.call('ZREM', KEYS[1], member)
  local body = redis.call('HGET', KEYS[5], id)
  if body then
    redis.call('ZADD', KEYS[2], ARGV[2], id)
    redis.call('HSET', KEYS[3], id, ARGV[3] .. '|' .. score)
    return {id, body}
  end
  redis.call('HDEL', KEYS[4], id)
end
"#;

/// KEYS: jobs, ready, members, refs, seq.
/// ARGV: job id, agendamento id, job JSON, eligibility (ms).
const ENQUEUE_LUA: &str = r#"
local existing = redis.call('HGET', KEYS[4], ARGV[2])
if existing then
  return existing
end
local seq = redis.call('INCR', KEYS[5])
local member = string.format('%020d|%s', seq, ARGV[1])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
redis.call('HSET', KEYS[3], ARGV[1], member)
redis.call('HSET', KEYS[4], ARGV[2], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[4], member)
return ARGV[1]
"#;

/// KEYS: jobs, leased, leases, members, refs. ARGV: job id, token, agendamento id.
const ACK_LUA: &str = r#"
local lease = redis.call('HGET', KEYS[3], ARGV[1])
if not lease or string.sub(lease, 1, 36) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
if redis.call('HGET', KEYS[5], ARGV[3]) == ARGV[1] then
  redis.call('HDEL', KEYS[5], ARGV[3])
end
return 1
"#;

/// KEYS: jobs, leased, leases, members, ready.
/// ARGV: job id, token, job JSON, eligibility (ms).
const RESCHEDULE_LUA: &str = r#"
local lease = redis.call('HGET', KEYS[3], ARGV[1])
if not lease or string.sub(lease, 1, 36) ~= ARGV[2] then
  return 0
end
local member = redis.call('HGET', KEYS[4], ARGV[1])
if not member then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[5], ARGV[4], member)
return 1
"#;

/// KEYS: jobs, leased, leases, members, refs, dead_letter.
/// ARGV: job id, token, agendamento id, dead letter JSON.
const BURY_LUA: &str = r#"
local lease = redis.call('HGET', KEYS[3], ARGV[1])
if not lease or string.sub(lease, 1, 36) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
if redis.call('HGET', KEYS[5], ARGV[3]) == ARGV[1] then
  redis.call('HDEL', KEYS[5], ARGV[3])
end
redis.call('LPUSH', KEYS[6], ARGV[4])
return 1
"#;

/// Redis key names of one queue.
#[derive(Debug, Clone)]
struct QueueKeys {
    jobs: String,
    ready: String,
    members: String,
    leased: String,
    leases: String,
    refs: String,
    seq: String,
    dead_letter: String,
}

impl QueueKeys {
    fn new(queue: &str) -> Self {
        Self {
            jobs: format!("{}:jobs", queue),
            ready: format!("{}:ready", queue),
            members: format!("{}:members", queue),
            leased: format!("{}:leased", queue),
            leases: format!("{}:leases", queue),
            refs: format!("{}:refs", queue),
            seq: format!("{}:seq", queue),
            dead_letter: format!("{}:dead_letter", queue),
        }
    }
}

/// Queue backend stored in Redis.
pub struct RedisBackend {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    enqueue: Script,
    lease: Script,
    reclaim: Script,
    ack: Script,
    reschedule: Script,
    bury: Script,
}

impl RedisBackend {
    /// Connects to the Redis server described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, QueueError> {
        let client = ::redis::Client::open(config.redis_url())
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        debug!(url = %config.redacted_url(), "Connected to queue store");
        Ok(Self::from_connection(redis))
    }

    /// Creates a backend from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            enqueue: Script::new(ENQUEUE_LUA),
            lease: Script::new(&format!("{}{}", RECLAIM_LUA, LEASE_LUA)),
            reclaim: Script::new(&format!("{}return reclaimed\n", RECLAIM_LUA)),
            ack: Script::new(ACK_LUA),
            reschedule: Script::new(RESCHEDULE_LUA),
            bury: Script::new(BURY_LUA),
        }
    }
}

/// Maps transport failures to `ConnectionFailed`, keeping command errors.
fn map_redis_error(e: RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
    {
        QueueError::ConnectionFailed(e.to_string())
    } else {
        QueueError::RedisError(e)
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn push(&self, queue: &str, job: &Job) -> Result<Uuid, QueueError> {
        let keys = QueueKeys::new(queue);
        let body = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();

        let live: String = self
            .enqueue
            .key(&keys.jobs)
            .key(&keys.ready)
            .key(&keys.members)
            .key(&keys.refs)
            .key(&keys.seq)
            .arg(job.id.to_string())
            .arg(job.agendamento_id().to_string())
            .arg(body)
            .arg(job.available_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Uuid::parse_str(&live).map_err(|e| {
            QueueError::ConnectionFailed(format!("corrupt job reference '{}': {}", live, e))
        })
    }

    async fn lease(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let keys = QueueKeys::new(queue);
        let token = Uuid::new_v4();
        let expires_at = lease_expiry(now, lease_duration);
        let mut conn = self.redis.clone();

        let leased: Option<(String, String)> = self
            .lease
            .key(&keys.ready)
            .key(&keys.leased)
            .key(&keys.leases)
            .key(&keys.members)
            .key(&keys.jobs)
            .arg(now.timestamp_millis())
            .arg(expires_at.timestamp_millis())
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let Some((id, body)) = leased else {
            return Ok(None);
        };

        let mut job: Job = match serde_json::from_str(&body) {
            Ok(job) => job,
            Err(e) => {
                warn!(queue = queue, job_id = %id, error = %e, "Leased job is not decodable");
                return Err(QueueError::SerializationFailed(e));
            }
        };
        job.lease_token = Some(token);
        job.lease_expires_at = Some(expires_at);
        Ok(Some(job))
    }

    async fn ack(&self, queue: &str, job: &Job, token: Uuid) -> Result<bool, QueueError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.redis.clone();

        let removed: i64 = self
            .ack
            .key(&keys.jobs)
            .key(&keys.leased)
            .key(&keys.leases)
            .key(&keys.members)
            .key(&keys.refs)
            .arg(job.id.to_string())
            .arg(token.to_string())
            .arg(job.agendamento_id().to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(removed == 1)
    }

    async fn reschedule(&self, queue: &str, job: &Job, token: Uuid) -> Result<bool, QueueError> {
        let keys = QueueKeys::new(queue);
        let body = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();

        let moved: i64 = self
            .reschedule
            .key(&keys.jobs)
            .key(&keys.leased)
            .key(&keys.leases)
            .key(&keys.members)
            .key(&keys.ready)
            .arg(job.id.to_string())
            .arg(token.to_string())
            .arg(body)
            .arg(job.available_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(moved == 1)
    }

    async fn bury(
        &self,
        queue: &str,
        entry: &DeadLetter,
        token: Uuid,
    ) -> Result<bool, QueueError> {
        let keys = QueueKeys::new(queue);
        let body = serde_json::to_string(entry)?;
        let mut conn = self.redis.clone();

        let moved: i64 = self
            .bury
            .key(&keys.jobs)
            .key(&keys.leased)
            .key(&keys.leases)
            .key(&keys.members)
            .key(&keys.refs)
            .key(&keys.dead_letter)
            .arg(entry.job.id.to_string())
            .arg(token.to_string())
            .arg(entry.job.agendamento_id().to_string())
            .arg(body)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(moved == 1)
    }

    async fn reclaim_expired(&self, queue: &str, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.redis.clone();

        let reclaimed: i64 = self
            .reclaim
            .key(&keys.ready)
            .key(&keys.leased)
            .key(&keys.leases)
            .key(&keys.members)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(reclaimed.max(0) as usize)
    }

    async fn stats(&self, queue: &str, now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
        let keys = QueueKeys::new(queue);
        let now_ms = now.timestamp_millis();
        let mut conn = self.redis.clone();

        let (ready, delayed, leased, dead): (usize, usize, usize, usize) = ::redis::pipe()
            .zcount(&keys.ready, "-inf", now_ms)
            .zcount(&keys.ready, format!("({}", now_ms), "+inf")
            .zcard(&keys.leased)
            .llen(&keys.dead_letter)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(QueueStats {
            queue_name: queue.to_string(),
            ready_jobs: ready,
            delayed_jobs: delayed,
            leased_jobs: leased,
            dead_letter_jobs: dead,
        })
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let keys = QueueKeys::new(queue);
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&keys.dead_letter, 0, limit as isize - 1)
            .await
            .map_err(map_redis_error)?;

        let entries: Result<Vec<DeadLetter>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();

        Ok(entries?)
    }

    async fn clear(&self, queue: &str) -> Result<(), QueueError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.redis.clone();

        let mut pipe = ::redis::pipe();
        pipe.del(&keys.jobs)
            .del(&keys.ready)
            .del(&keys.members)
            .del(&keys.leased)
            .del(&keys.leases)
            .del(&keys.refs)
            .del(&keys.seq)
            .del(&keys.dead_letter);
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keys_are_prefixed() {
        let keys = QueueKeys::new("posts");
        assert_eq!(keys.jobs, "posts:jobs");
        assert_eq!(keys.ready, "posts:ready");
        assert_eq!(keys.dead_letter, "posts:dead_letter");
    }

    #[test]
    fn test_member_prefix_width_matches_scripts() {
        // The scripts read the job id from byte 22 of a ready member and the
        // eligibility score from byte 38 of a lease entry.
        let member = format!("{:020}|{}", 7, Uuid::nil());
        assert_eq!(&member[21..], Uuid::nil().to_string());

        let lease = format!("{}|{}", Uuid::nil(), 1_700_000_000_000i64);
        assert_eq!(&lease[37..], "1700000000000");
    }
}
