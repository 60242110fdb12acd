//! CLI command definitions for agendamento-publisher.
//!
//! Every command builds its collaborators explicitly from the environment
//! (`AppConfig`) and the flags below; nothing is held in globals.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::agendamento::{Agendamento, MediaRef, Platform, PostPayload};
use crate::config::{AppConfig, WorkerSettings};
use crate::loader::{AgendamentoLoader, DEFAULT_BATCH_SIZE};
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::publish::{InstagramPublisher, PublisherRegistry, StaticTokenProvider};
use crate::scheduler::{JobQueue, Processor, WorkerPool, WorkerPoolConfig};
use crate::storage::{AgendamentoStore, PgAgendamentoStore};
use crate::trigger::TriggerEndpoint;

/// Scheduled social-media post publisher.
#[derive(Parser)]
#[command(name = "agendamento-publisher")]
#[command(about = "Publish scheduled social-media posts through a Redis job queue")]
#[command(version)]
#[command(
    long_about = "agendamento-publisher loads due agendamentos (scheduled posts) from PostgreSQL, enqueues them in a Redis job queue and publishes them to the target platform with retries.\n\nExample usage:\n  agendamento-publisher migrate\n  agendamento-publisher trigger\n  agendamento-publisher worker --workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// PostgreSQL URL of the agendamento store.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Queue name (prefix of every Redis key).
    #[arg(short, long, env = "QUEUE_NAME", global = true)]
    pub queue: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run one sweep of due agendamentos and print the run log as JSON.
    Trigger(TriggerArgs),

    /// Run the worker pool that publishes queued jobs.
    Worker(WorkerArgs),

    /// Create or update the agendamento tables.
    Migrate,

    /// Create a pending agendamento.
    Schedule(ScheduleArgs),

    /// Print queue and agendamento statistics.
    Stats(StatsArgs),

    /// List jobs that exhausted their retries.
    #[command(name = "dead-letters", alias = "dlq")]
    DeadLetters(DeadLettersArgs),
}

/// Arguments for `agendamento-publisher trigger`.
#[derive(Parser, Debug)]
pub struct TriggerArgs {
    /// Maximum number of agendamentos examined in this sweep.
    #[arg(short = 'b', long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
}

/// Arguments for `agendamento-publisher worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of concurrent workers (default: WORKER_CONCURRENCY or 4).
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Process every eligible job once, then exit.
    #[arg(long)]
    pub drain: bool,

    /// Also run a loader sweep every N seconds.
    #[arg(long)]
    pub sweep_interval: Option<u64>,
}

/// Arguments for `agendamento-publisher schedule`.
#[derive(Parser, Debug)]
pub struct ScheduleArgs {
    /// Post caption.
    #[arg(short = 'c', long)]
    pub caption: String,

    /// Image URL (repeat for a carousel).
    #[arg(long = "image")]
    pub images: Vec<String>,

    /// Video URL (repeat for a carousel).
    #[arg(long = "video")]
    pub videos: Vec<String>,

    /// Due time in RFC 3339 (default: now).
    #[arg(long, conflicts_with = "in_secs")]
    pub at: Option<String>,

    /// Due time as seconds from now.
    #[arg(long)]
    pub in_secs: Option<i64>,

    /// Target platform.
    #[arg(short = 'p', long, default_value = "instagram")]
    pub platform: String,
}

/// Arguments for `agendamento-publisher stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Output Prometheus text exposition.
    #[arg(long, conflicts_with = "json")]
    pub prometheus: bool,
}

/// Arguments for `agendamento-publisher dead-letters`.
#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// Maximum number of entries, newest first.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = AppConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(queue) = cli.queue {
        config.worker.queue_name = queue;
    }

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    match cli.command {
        Commands::Trigger(args) => run_trigger_command(&config, args).await,
        Commands::Worker(args) => run_worker_command(config, args).await,
        Commands::Migrate => run_migrate_command(&config).await,
        Commands::Schedule(args) => run_schedule_command(&config, args).await,
        Commands::Stats(args) => run_stats_command(&config, args).await,
        Commands::DeadLetters(args) => run_dead_letters_command(&config, args).await,
    }
}

// ============================================================================
// Shared construction
// ============================================================================

async fn connect_store(config: &AppConfig) -> anyhow::Result<Arc<PgAgendamentoStore>> {
    let store = PgAgendamentoStore::connect(&config.database_url).await?;
    Ok(Arc::new(store))
}

async fn connect_queue(config: &AppConfig) -> anyhow::Result<Arc<JobQueue>> {
    let queue = JobQueue::connect(&config.connection, config.worker.queue_name.clone()).await?;
    Ok(Arc::new(queue))
}

fn build_loader(
    config: &AppConfig,
    store: Arc<dyn AgendamentoStore>,
    queue: Arc<JobQueue>,
    batch_size: usize,
) -> AgendamentoLoader {
    AgendamentoLoader::new(store, queue)
        .with_batch_size(batch_size)
        .with_max_retries(config.worker.max_retries)
}

fn build_publishers(settings: &WorkerSettings) -> anyhow::Result<PublisherRegistry> {
    let tokens = Arc::new(StaticTokenProvider::from_env()?);
    let instagram = InstagramPublisher::from_env(tokens, settings.publish_budget())?;
    Ok(PublisherRegistry::new().with_publisher(Arc::new(instagram)))
}

// ============================================================================
// Command implementations
// ============================================================================

async fn run_trigger_command(config: &AppConfig, args: TriggerArgs) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let queue = connect_queue(config).await?;
    let loader = build_loader(config, store, queue, args.batch_size);

    let response = TriggerEndpoint::new(Arc::new(loader)).invoke().await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if !response.success {
        anyhow::bail!(
            "Trigger failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}

async fn run_worker_command(config: AppConfig, args: WorkerArgs) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    let queue = connect_queue(&config).await?;
    let publishers = build_publishers(&config.worker)?;

    let mut pool_config = WorkerPoolConfig::from_settings(&config.worker);
    if let Some(workers) = args.workers {
        pool_config.num_workers = workers.max(1);
    }

    let processor = Arc::new(Processor::new(
        queue.clone(),
        store.clone(),
        publishers,
        &pool_config,
    ));

    if args.drain {
        let outcomes = processor.drain().await?;
        info!(processed = outcomes.len(), "Drained queue");
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
        return Ok(());
    }

    let (sweeper_tx, _) = broadcast::channel(1);
    let sweeper = args.sweep_interval.map(|secs| {
        let loader = build_loader(&config, store.clone(), queue.clone(), DEFAULT_BATCH_SIZE);
        let endpoint = TriggerEndpoint::new(Arc::new(loader));
        tokio::spawn(endpoint.run_every(Duration::from_secs(secs.max(1)), sweeper_tx.subscribe()))
    });

    let mut pool = WorkerPool::new(pool_config, processor);
    pool.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received interrupt, shutting down");

    if let Some(handle) = sweeper {
        // A sweep in progress finishes before the task exits.
        let _ = sweeper_tx.send(());
        if let Err(e) = handle.await {
            warn!(error = %e, "Periodic sweep task failed");
        }
    }
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        published = stats.jobs_published,
        failed = stats.jobs_failed,
        skipped = stats.jobs_skipped,
        success_rate = stats.success_rate(),
        "Worker pool stopped"
    );
    Ok(())
}

async fn run_migrate_command(config: &AppConfig) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let applied = store.run_migrations().await?;

    if applied.is_empty() {
        println!("Schema is up to date");
    } else {
        for name in &applied {
            println!("Applied {}", name);
        }
    }
    Ok(())
}

async fn run_schedule_command(config: &AppConfig, args: ScheduleArgs) -> anyhow::Result<()> {
    let platform: Platform = args.platform.parse().map_err(anyhow::Error::msg)?;
    let due_at = resolve_due_at(args.at.as_deref(), args.in_secs, Utc::now())?;

    let mut payload = PostPayload::new(args.caption);
    for url in args.images {
        payload = payload.with_media(MediaRef::image(url));
    }
    for url in args.videos {
        payload = payload.with_media(MediaRef::video(url));
    }

    let agendamento = Agendamento::new(due_at, platform, payload);
    let store = connect_store(config).await?;
    store.insert(&agendamento).await?;

    info!(agendamento_id = %agendamento.id, due_at = %due_at, "Agendamento scheduled");
    println!("{}", agendamento.id);
    Ok(())
}

async fn run_stats_command(config: &AppConfig, args: StatsArgs) -> anyhow::Result<()> {
    let queue = connect_queue(config).await?;
    let queue_stats = queue.stats().await?;
    MetricsCollector::new().update_queue_stats(&queue_stats);

    if args.prometheus {
        print!("{}", export_metrics());
        return Ok(());
    }

    let store = connect_store(config).await?;
    let by_status = store.count_by_status().await?;

    if args.json {
        let statuses: serde_json::Map<String, serde_json::Value> = by_status
            .iter()
            .map(|(status, count)| (status.to_string(), serde_json::json!(count)))
            .collect();
        let output = serde_json::json!({
            "queue": queue_stats,
            "agendamentos": statuses,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Queue: {}", queue_stats.queue_name);
    println!("  ready:       {}", queue_stats.ready_jobs);
    println!("  delayed:     {}", queue_stats.delayed_jobs);
    println!("  leased:      {}", queue_stats.leased_jobs);
    println!("  dead letter: {}", queue_stats.dead_letter_jobs);
    println!("Agendamentos:");
    for (status, count) in by_status {
        println!("  {:<12} {}", format!("{}:", status), count);
    }
    Ok(())
}

async fn run_dead_letters_command(
    config: &AppConfig,
    args: DeadLettersArgs,
) -> anyhow::Result<()> {
    let queue = connect_queue(config).await?;
    let entries = queue.peek_dead_letter(args.limit).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No dead letters");
        return Ok(());
    }

    for entry in entries {
        println!(
            "{}  job={} agendamento={} attempts={}  {}",
            entry.moved_at.to_rfc3339(),
            entry.job.id,
            entry.job.agendamento_id(),
            entry.job.retry_count,
            entry.error
        );
    }
    Ok(())
}

/// Resolves the due time from `--at` or `--in-secs`, defaulting to `now`.
fn resolve_due_at(
    at: Option<&str>,
    in_secs: Option<i64>,
    now: DateTime<Utc>,
) -> anyhow::Result<DateTime<Utc>> {
    if let Some(raw) = at {
        let parsed = DateTime::parse_from_rfc3339(raw)
            .map_err(|e| anyhow::anyhow!("Invalid --at '{}': {}", raw, e))?;
        return Ok(parsed.with_timezone(&Utc));
    }

    Ok(match in_secs {
        Some(secs) => now + chrono::Duration::seconds(secs),
        None => now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_trigger_defaults() {
        let cli = Cli::try_parse_from(["agendamento-publisher", "trigger"]).expect("should parse");

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Trigger(args) => assert_eq!(args.batch_size, DEFAULT_BATCH_SIZE),
            _ => panic!("Expected Trigger command"),
        }
    }

    #[test]
    fn test_worker_options() {
        let cli = Cli::try_parse_from([
            "agendamento-publisher",
            "worker",
            "-w",
            "8",
            "--sweep-interval",
            "60",
            "--log-level",
            "debug",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.workers, Some(8));
                assert_eq!(args.sweep_interval, Some(60));
                assert!(!args.drain);
            }
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_schedule_collects_media() {
        let cli = Cli::try_parse_from([
            "agendamento-publisher",
            "schedule",
            "-c",
            "Hello",
            "--image",
            "https://x/1.jpg",
            "--image",
            "https://x/2.jpg",
            "--video",
            "https://x/3.mp4",
            "--in-secs",
            "120",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Schedule(args) => {
                assert_eq!(args.caption, "Hello");
                assert_eq!(args.images.len(), 2);
                assert_eq!(args.videos, vec!["https://x/3.mp4".to_string()]);
                assert_eq!(args.in_secs, Some(120));
                assert_eq!(args.platform, "instagram");
            }
            _ => panic!("Expected Schedule command"),
        }
    }

    #[test]
    fn test_schedule_rejects_both_due_flags() {
        let result = Cli::try_parse_from([
            "agendamento-publisher",
            "schedule",
            "-c",
            "Hello",
            "--at",
            "2030-01-01T00:00:00Z",
            "--in-secs",
            "5",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_dead_letters_alias() {
        let cli = Cli::try_parse_from(["agendamento-publisher", "dlq", "-n", "5"])
            .expect("should parse");
        match cli.command {
            Commands::DeadLetters(args) => assert_eq!(args.limit, 5),
            _ => panic!("Expected DeadLetters command"),
        }
    }

    #[test]
    fn test_resolve_due_at() {
        let now = Utc::now();

        assert_eq!(resolve_due_at(None, None, now).expect("default"), now);
        assert_eq!(
            resolve_due_at(None, Some(90), now).expect("relative"),
            now + chrono::Duration::seconds(90)
        );

        let absolute = resolve_due_at(Some("2030-01-01T12:00:00+02:00"), None, now)
            .expect("absolute");
        assert_eq!(absolute.to_rfc3339(), "2030-01-01T10:00:00+00:00");

        assert!(resolve_due_at(Some("tomorrow"), None, now).is_err());
    }
}
