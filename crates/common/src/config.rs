use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (idempotency claims)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// GitHub REST API base URL
    pub github_api_url: String,

    /// Optional GitHub token; unauthenticated requests are heavily rate limited
    pub github_token: Option<String>,

    /// Telegram Bot API base URL
    pub telegram_api_url: String,

    /// Telegram bot token
    pub telegram_bot_token: Option<String>,

    /// Minimum time between two polls of the same repository (default: 300)
    pub poll_interval_secs: u64,

    /// How often the poll loop looks for due repositories (default: 60)
    pub poll_tick_secs: u64,

    /// Notification cycle interval (default: 10)
    pub notify_interval_secs: u64,

    /// Number of repositories polled concurrently within one cycle (default: 4)
    pub poll_concurrency: usize,

    /// Maximum number of pending deliveries handled per notification cycle (default: 100)
    pub notify_batch_size: i64,

    /// Attempts per outbound call, including the first one (default: 3)
    pub retry_attempts: u32,

    /// Delay before the first retry, doubled after each retry (default: 2000)
    pub retry_base_delay_ms: u64,

    /// Timeout applied to every single outbound attempt (default: 15)
    pub outbound_timeout_secs: u64,

    /// Lifetime of a delivery idempotency claim (default: 600)
    pub idempotency_ttl_secs: u64,

    /// Drop the idempotency claim when the guarded operation fails (default: false)
    pub idempotency_release_on_failure: bool,

    /// Failed deliveries at or above this attempt count are dead-lettered (default: 5)
    pub requeue_max_attempts: i32,

    /// Backoff before the first requeue of a failed delivery, doubled per attempt (default: 60)
    pub requeue_base_backoff_secs: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", "20")?,
            github_api_url: std::env::var("GITHUB_API_URL")
                .unwrap_or_else(|_| "https://api.github.com".to_string()),
            github_token: non_empty_env("GITHUB_TOKEN"),
            telegram_api_url: std::env::var("TELEGRAM_API_URL")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            telegram_bot_token: non_empty_env("TELEGRAM_BOT_TOKEN"),
            poll_interval_secs: parse_env("POLL_INTERVAL_SECS", "300")?,
            poll_tick_secs: parse_env("POLL_TICK_SECS", "60")?,
            notify_interval_secs: parse_env("NOTIFY_INTERVAL_SECS", "10")?,
            poll_concurrency: parse_env("POLL_CONCURRENCY", "4")?,
            notify_batch_size: parse_env("NOTIFY_BATCH_SIZE", "100")?,
            retry_attempts: parse_env("RETRY_ATTEMPTS", "3")?,
            retry_base_delay_ms: parse_env("RETRY_BASE_DELAY_MS", "2000")?,
            outbound_timeout_secs: parse_env("OUTBOUND_TIMEOUT_SECS", "15")?,
            idempotency_ttl_secs: parse_env("IDEMPOTENCY_TTL_SECS", "600")?,
            idempotency_release_on_failure: parse_env("IDEMPOTENCY_RELEASE_ON_FAILURE", "false")?,
            requeue_max_attempts: parse_env("REQUEUE_MAX_ATTEMPTS", "5")?,
            requeue_base_backoff_secs: parse_env("REQUEUE_BASE_BACKOFF_SECS", "60")?,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_tick(&self) -> Duration {
        Duration::from_secs(self.poll_tick_secs)
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_secs(self.notify_interval_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn outbound_timeout(&self) -> Duration {
        Duration::from_secs(self.outbound_timeout_secs)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn requeue_base_backoff(&self) -> Duration {
        Duration::from_secs(self.requeue_base_backoff_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> anyhow::Result<T> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    parse_value(key, &raw)
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> anyhow::Result<T> {
    raw.trim().parse().map_err(|_| {
        anyhow::anyhow!(
            "{} must be a valid {}",
            key,
            std::any::type_name::<T>()
        )
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
