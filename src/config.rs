//! Environment-driven configuration.
//!
//! Every value has a documented default. Values that are present but cannot be
//! parsed fall back to their default with a warning instead of failing
//! startup, so a bad deployment variable degrades to the default rather than
//! taking the publisher down.

use std::time::Duration;

use tracing::warn;

/// Default Redis host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default Redis port.
pub const DEFAULT_PORT: u16 = 6379;

/// Default queue name.
pub const DEFAULT_QUEUE_NAME: &str = "agendamentos";

/// Default PostgreSQL URL for the agendamento store.
pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost/agendamentos";

/// Connection parameters for the queue backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Redis host name or address.
    pub host: String,
    /// Redis port.
    pub port: u16,
    /// Password for the Redis `AUTH`, if any.
    pub credential: Option<String>,
    /// Whether to connect over TLS (`rediss://`).
    pub use_transport_security: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            credential: None,
            use_transport_security: false,
        }
    }
}

impl ConnectionConfig {
    /// Reads the connection parameters from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_HOST`: host (default: 127.0.0.1)
    /// - `REDIS_PORT`: positive port number (default: 6379)
    /// - `REDIS_PASSWORD`: credential (default: none)
    /// - `REDIS_TLS`: `true`/`1`/`yes`/`on` enables TLS (default: false)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the connection parameters through `lookup`.
    ///
    /// This is a pure function of what `lookup` returns, which keeps tests
    /// independent of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = non_empty(lookup("REDIS_HOST")) {
            config.host = host;
        }

        if let Some(raw) = lookup("REDIS_PORT") {
            config.port = parse_port(&raw).unwrap_or_else(|| {
                warn!(value = %raw, default = DEFAULT_PORT, "Invalid REDIS_PORT, using default");
                DEFAULT_PORT
            });
        }

        config.credential = non_empty(lookup("REDIS_PASSWORD"));

        if let Some(raw) = lookup("REDIS_TLS") {
            config.use_transport_security = parse_bool(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "Invalid REDIS_TLS, TLS disabled");
                false
            });
        }

        config
    }

    /// Renders the Redis connection URL.
    ///
    /// The credential is percent-encoded so passwords containing `@` or `:`
    /// do not corrupt the URL.
    pub fn redis_url(&self) -> String {
        let scheme = if self.use_transport_security {
            "rediss"
        } else {
            "redis"
        };

        match &self.credential {
            Some(credential) => format!(
                "{}://:{}@{}:{}",
                scheme,
                urlencoding::encode(credential),
                self.host,
                self.port
            ),
            None => format!("{}://{}:{}", scheme, self.host, self.port),
        }
    }

    /// Renders the URL with the credential masked, for logging.
    pub fn redacted_url(&self) -> String {
        let scheme = if self.use_transport_security {
            "rediss"
        } else {
            "redis"
        };
        let auth = if self.credential.is_some() { ":***@" } else { "" };
        format!("{}://{}{}:{}", scheme, auth, self.host, self.port)
    }
}

/// Settings for the worker pool and retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Queue name (prefix of every Redis key).
    pub queue_name: String,
    /// How long a leased job stays invisible to other workers.
    pub lease_duration: Duration,
    /// Sleep between lease attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Upper bound for one publish attempt, every platform API call included.
    pub publish_timeout: Duration,
    /// Attempts allowed before a job is dead-lettered.
    pub max_retries: u32,
    /// Base delay of the exponential backoff.
    pub retry_base_delay: Duration,
    /// Cap of the exponential backoff.
    pub retry_max_delay: Duration,
    /// Time given to workers to finish their current job on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            lease_duration: Duration::from_secs(300),
            poll_interval: Duration::from_millis(1000),
            publish_timeout: Duration::from_secs(180),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(30),
            retry_max_delay: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerSettings {
    /// Reads worker settings from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `WORKER_CONCURRENCY` (default: 4)
    /// - `QUEUE_NAME` (default: agendamentos)
    /// - `LEASE_SECS` (default: 300, raised above `PUBLISH_TIMEOUT_SECS`)
    /// - `POLL_INTERVAL_MS` (default: 1000)
    /// - `PUBLISH_TIMEOUT_SECS` (default: 180)
    /// - `MAX_RETRIES` (default: 3)
    /// - `RETRY_BASE_SECS` (default: 30)
    /// - `RETRY_MAX_SECS` (default: 3600)
    /// - `SHUTDOWN_TIMEOUT_SECS` (default: 60)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads worker settings through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let concurrency = positive_or(&lookup, "WORKER_CONCURRENCY", defaults.concurrency as u64);
        let lease_secs = positive_or(&lookup, "LEASE_SECS", defaults.lease_duration.as_secs());
        let poll_ms = positive_or(
            &lookup,
            "POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        );
        let publish_secs = positive_or(
            &lookup,
            "PUBLISH_TIMEOUT_SECS",
            defaults.publish_timeout.as_secs(),
        );
        let max_retries = positive_or(&lookup, "MAX_RETRIES", u64::from(defaults.max_retries));
        let base_secs = positive_or(
            &lookup,
            "RETRY_BASE_SECS",
            defaults.retry_base_delay.as_secs(),
        );
        let max_secs = positive_or(&lookup, "RETRY_MAX_SECS", defaults.retry_max_delay.as_secs());
        let shutdown_secs = positive_or(
            &lookup,
            "SHUTDOWN_TIMEOUT_SECS",
            defaults.shutdown_timeout.as_secs(),
        );

        // A lease must outlive the attempt it covers.
        let lease_secs = if lease_secs <= publish_secs {
            let raised = publish_secs.saturating_mul(2);
            warn!(
                lease_secs = lease_secs,
                publish_timeout_secs = publish_secs,
                raised_to = raised,
                "Lease shorter than publish timeout, raising it"
            );
            raised
        } else {
            lease_secs
        };

        Self {
            concurrency: concurrency as usize,
            queue_name: non_empty(lookup("QUEUE_NAME")).unwrap_or(defaults.queue_name),
            lease_duration: Duration::from_secs(lease_secs),
            poll_interval: Duration::from_millis(poll_ms),
            publish_timeout: Duration::from_secs(publish_secs),
            max_retries: u32::try_from(max_retries).unwrap_or(defaults.max_retries),
            retry_base_delay: Duration::from_secs(base_secs),
            retry_max_delay: Duration::from_secs(max_secs.max(base_secs)),
            shutdown_timeout: Duration::from_secs(shutdown_secs),
        }
    }

    /// Time a publisher may plan for one attempt.
    ///
    /// Kept below `publish_timeout` so a publisher gives up on its own before
    /// the attempt is cut off from outside.
    pub fn publish_budget(&self) -> Duration {
        self.publish_timeout * 9 / 10
    }
}

/// Complete process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub worker: WorkerSettings,
    /// PostgreSQL URL of the agendamento store (`DATABASE_URL`).
    pub database_url: String,
}

impl AppConfig {
    /// Reads the whole configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            connection: ConnectionConfig::from_env(),
            worker: WorkerSettings::from_env(),
            database_url: non_empty(std::env::var("DATABASE_URL").ok())
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses a non-zero port number.
fn parse_port(raw: &str) -> Option<u16> {
    raw.trim().parse::<u16>().ok().filter(|port| *port > 0)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Reads a positive integer, falling back to `default` when absent or invalid.
fn positive_or<F>(lookup: &F, key: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(value) if value > 0 => value,
            _ => {
                warn!(key = key, value = %raw, default = default, "Invalid value, using default");
                default
            }
        },
        None => default,
    }
}
