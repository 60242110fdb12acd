//! agendamento-publisher: scheduled social-media post publisher.
//!
//! Due agendamentos (scheduled posts) are loaded from storage, enqueued in a
//! Redis-backed job queue and published to the target platform by a pool of
//! workers, with exponential backoff and dead-lettering on failure.

pub mod agendamento;
pub mod cli;
pub mod config;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod publish;
pub mod scheduler;
pub mod storage;
pub mod trigger;

pub use agendamento::{Agendamento, AgendamentoStatus, MediaRef, Platform, PostPayload};
pub use config::{AppConfig, ConnectionConfig, WorkerSettings};
pub use error::{LoaderError, PublishError, StorageError};
pub use loader::{AgendamentoLoader, LoadReport};
pub use scheduler::{Job, JobOutcome, JobQueue, QueueError, RetryPolicy};
pub use trigger::{TriggerEndpoint, TriggerResponse};
