//! Job queue and worker pool for publishing due agendamentos.
//!
//! This module provides the execution side of the publisher:
//!
//! - **JobQueue**: Lease-based job queue over a pluggable backend (Redis or in-process)
//! - **WorkerPool**: Pool of workers that publish leased jobs concurrently
//! - **Job**: Job definitions with retry logic and dead letter support
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────┐      ┌──────────────┐
//!   │   Trigger    │─────▶│    Loader    │
//!   │ (CLI / cron) │      │ (due sweep)  │
//!   └──────────────┘      └──────┬───────┘
//!                                │ enqueue
//!                         ┌──────▼───────┐
//!                         │    Redis     │
//!                         │    Queue     │
//!                         └──────┬───────┘
//!                                │ lease
//!         ┌──────────────────────┼──────────────────────┐
//!         ▼                      ▼                      ▼
//!    ┌─────────┐            ┌─────────┐            ┌─────────┐
//!    │ Worker 1│            │ Worker 2│            │ Worker N│
//!    └────┬────┘            └────┬────┘            └────┬────┘
//!         └──────────────────────┼──────────────────────┘
//!                                ▼
//!                      Instagram Graph API
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use agendamento_publisher::scheduler::{JobQueue, Processor, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let queue = Arc::new(JobQueue::connect(&connection, "agendamentos").await?);
//! let config = WorkerPoolConfig::new(4);
//! let processor = Arc::new(Processor::new(queue, store, publishers, &config));
//!
//! let mut pool = WorkerPool::new(config, processor);
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic lease**: A Lua script moves a job from the ready set to the leased set
//! - **Crash recovery**: Jobs whose lease expired are returned to the ready set
//! - **Dead letter queue**: Failed jobs after max attempts are moved to DLQ for analysis
//! - **Graceful shutdown**: Workers finish current jobs before stopping

pub mod backend;
pub mod job;
pub mod queue;
pub mod worker_pool;

// Re-export main types for convenience
pub use backend::{MemoryBackend, QueueBackend, RedisBackend};
pub use job::{Job, JobOutcome, PublishTask, RetryPolicy, DEFAULT_MAX_RETRIES};
pub use queue::{DeadLetter, JobQueue, QueueError, QueueStats};
pub use worker_pool::{PoolError, PoolStats, Processor, Worker, WorkerPool, WorkerPoolConfig};
