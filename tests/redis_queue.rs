//! Integration tests for the Redis queue backend.
//!
//! These tests need a running Redis server configured through the usual
//! `REDIS_HOST` / `REDIS_PORT` / `REDIS_PASSWORD` / `REDIS_TLS` variables.
//! Run with: cargo test --test redis_queue -- --ignored

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use agendamento_publisher::agendamento::{Agendamento, Platform, PostPayload};
use agendamento_publisher::config::ConnectionConfig;
use agendamento_publisher::scheduler::{Job, JobQueue, PublishTask, QueueError};
use chrono::Utc;
use uuid::Uuid;

async fn connect_queue() -> JobQueue {
    let config = ConnectionConfig::from_env();
    let name = format!("it_{}", Uuid::new_v4().simple());
    JobQueue::connect(&config, name)
        .await
        .expect("Redis must be reachable for integration tests")
}

fn job() -> Job {
    let post = Agendamento::new(Utc::now(), Platform::Instagram, PostPayload::new("it"));
    Job::new(PublishTask::from_agendamento(&post))
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_queue -- --ignored
async fn test_enqueue_lease_acknowledge() {
    let queue = connect_queue().await;

    let first = job();
    let second = job();
    queue.enqueue(first.clone()).await.expect("enqueue");
    queue.enqueue(second.clone()).await.expect("enqueue");

    let leased = queue
        .lease(Duration::from_secs(30))
        .await
        .expect("lease")
        .expect("job");
    assert_eq!(leased.id, first.id, "leases follow enqueue order");
    assert!(leased.lease_token.is_some());

    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.ready_jobs, 1);
    assert_eq!(stats.leased_jobs, 1);

    queue.acknowledge(&leased).await.expect("ack");
    assert!(matches!(
        queue.acknowledge(&leased).await,
        Err(QueueError::JobNotFound(_))
    ));

    queue.clear().await.expect("clear");
}

#[tokio::test]
#[ignore]
async fn test_duplicate_agendamento_keeps_one_live_job() {
    let queue = connect_queue().await;

    let original = job();
    let mut duplicate = Job::new(original.task.clone());
    duplicate.id = Uuid::new_v4();

    let first_id = queue.enqueue(original.clone()).await.expect("enqueue");
    let second_id = queue.enqueue(duplicate).await.expect("enqueue");
    assert_eq!(first_id, second_id);
    assert_eq!(queue.stats().await.expect("stats").ready_jobs, 1);

    queue.clear().await.expect("clear");
}

#[tokio::test]
#[ignore]
async fn test_retry_delays_and_dead_letters() {
    let queue = connect_queue().await;
    queue.enqueue(job().with_max_retries(2)).await.expect("enqueue");

    let leased = queue
        .lease(Duration::from_secs(30))
        .await
        .expect("lease")
        .expect("job");
    let next = queue
        .retry(&leased, Duration::from_secs(60), "boom")
        .await
        .expect("retry");
    assert_eq!(next.retry_count, 1);

    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.delayed_jobs, 1);
    assert!(queue.lease(Duration::from_secs(30)).await.expect("lease").is_none());

    queue.clear().await.expect("clear");
    queue
        .enqueue(job().with_max_retries(1))
        .await
        .expect("enqueue");
    let leased = queue
        .lease(Duration::from_secs(30))
        .await
        .expect("lease")
        .expect("job");
    assert!(matches!(
        queue.retry(&leased, Duration::ZERO, "fatal").await,
        Err(QueueError::RetriesExhausted { retry_count: 1, .. })
    ));

    let dead = queue.peek_dead_letter(5).await.expect("dead letters");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].error, "fatal");
    assert!(queue.lease(Duration::from_secs(30)).await.expect("lease").is_none());

    queue.clear().await.expect("clear");
}

#[tokio::test]
#[ignore]
async fn test_expired_lease_is_reclaimed() {
    let queue = connect_queue().await;
    queue.enqueue(job()).await.expect("enqueue");

    let crashed = queue
        .lease(Duration::from_millis(100))
        .await
        .expect("lease")
        .expect("job");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(queue.reclaim_expired().await.expect("reclaim"), 1);
    let recovered = queue
        .lease(Duration::from_secs(30))
        .await
        .expect("lease")
        .expect("job");
    assert_eq!(recovered.id, crashed.id);
    assert!(queue.acknowledge(&crashed).await.is_err());
    queue.acknowledge(&recovered).await.expect("ack");

    queue.clear().await.expect("clear");
}

#[tokio::test]
#[ignore]
async fn test_lease_skips_member_without_job_body() {
    let config = ConnectionConfig::from_env();
    let name = format!("it_{}", Uuid::new_v4().simple());
    let queue = JobQueue::connect(&config, name.clone())
        .await
        .expect("Redis must be reachable for integration tests");

    let orphan = job();
    let live = job();
    queue.enqueue(orphan.clone()).await.expect("enqueue");
    queue.enqueue(live.clone()).await.expect("enqueue");

    let client = redis::Client::open(config.redis_url()).expect("client");
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("connection");
    let _: i64 = redis::cmd("HDEL")
        .arg(format!("{}:jobs", name))
        .arg(orphan.id.to_string())
        .query_async(&mut conn)
        .await
        .expect("drop body");

    let leased = queue
        .lease(Duration::from_secs(30))
        .await
        .expect("lease")
        .expect("live job behind the orphan");
    assert_eq!(leased.id, live.id);
    assert_eq!(queue.stats().await.expect("stats").ready_jobs, 0);

    queue.clear().await.expect("clear");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_concurrent_leasers_get_distinct_jobs() {
    const JOBS: usize = 100;
    let queue = Arc::new(connect_queue().await);

    for _ in 0..JOBS {
        queue.enqueue(job()).await.expect("enqueue");
    }

    let tasks = (0..8).map(|_| {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(job) = queue.lease(Duration::from_secs(60)).await.expect("lease") {
                ids.push(job.id);
            }
            ids
        })
    });

    let mut all = Vec::new();
    for result in futures::future::join_all(tasks).await {
        all.extend(result.expect("task"));
    }
    let distinct: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), JOBS);
    assert_eq!(distinct.len(), JOBS);

    queue.clear().await.expect("clear");
}
