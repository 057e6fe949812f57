use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Order execution and monitoring configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Starting cash for lazily created portfolios.
    pub default_cash: Decimal,
    /// Delay between monitor checks of an untriggered order.
    pub monitor_poll: Duration,
    /// Interval of the stranded pending trade sweep.
    pub stale_sweep: Duration,
    /// Optimistic ledger write retries before giving up.
    pub ledger_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_cash: Decimal::from(100_000),
            monitor_poll: Duration::from_secs(60),
            stale_sweep: Duration::from_secs(300),
            ledger_retries: 3,
        }
    }
}

/// Job queue and worker configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Attempts per job, including the first.
    pub max_attempts: u32,
    /// Base of the exponential retry backoff.
    pub backoff_base: Duration,
    /// Jobs a single worker runs at once.
    pub concurrency: usize,
    /// How often a worker polls for due jobs.
    pub poll_interval: Duration,
    /// How long a claimed Redis job stays hidden before it is delivered again.
    pub lease: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(1000),
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
            lease: Duration::from_secs(300),
        }
    }
}

/// Strategy engine configuration.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Consecutive failed runs before a strategy is paused.
    pub failure_limit: u32,
    /// Execution log entries kept per strategy.
    pub execution_log_cap: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            failure_limit: 5,
            execution_log_cap: 1000,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// SQLite database path (`:memory:` for a throwaway store).
    pub database_path: String,
    /// Redis URL for the shared job queue (in-process queue when unset).
    pub redis_url: Option<String>,
    /// Base URL of the market data service.
    pub market_service_url: String,
    pub price_timeout: Duration,
    /// Webhook for trade confirmations and risk alerts (log only when unset).
    pub notify_webhook_url: Option<String>,
    pub engine: EngineConfig,
    pub queue: QueueConfig,
    pub strategy: StrategyConfig,
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3004,
            database_path: "reckon.db".to_string(),
            redis_url: None,
            market_service_url: "http://localhost:5000".to_string(),
            price_timeout: Duration::from_millis(5000),
            notify_webhook_url: None,
            engine: EngineConfig::default(),
            queue: QueueConfig::default(),
            strategy: StrategyConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = parse_env("PORT", 3004);

        let engine = EngineConfig {
            default_cash: parse_env("DEFAULT_CASH", Decimal::from(100_000)),
            monitor_poll: Duration::from_secs(parse_env("MONITOR_POLL_SECS", 60)),
            stale_sweep: Duration::from_secs(parse_env("STALE_SWEEP_SECS", 300)),
            ..Default::default()
        };

        let queue = QueueConfig {
            max_attempts: parse_env("JOB_MAX_ATTEMPTS", 5u32).max(1),
            backoff_base: Duration::from_millis(parse_env("JOB_BACKOFF_BASE_MS", 1000)),
            concurrency: parse_env("WORKER_CONCURRENCY", 4usize).max(1),
            poll_interval: Duration::from_millis(parse_env("QUEUE_POLL_MS", 250)),
            lease: Duration::from_secs(parse_env("JOB_LEASE_SECS", 300u64).max(1)),
        };

        let strategy = StrategyConfig {
            failure_limit: parse_env("STRATEGY_FAILURE_LIMIT", 5u32).max(1),
            execution_log_cap: parse_env("EXECUTION_LOG_CAP", 1000usize).max(1),
        };

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "reckon.db".to_string()),
            redis_url: optional_env("REDIS_URL"),
            market_service_url: env::var("MARKET_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:5000".to_string()),
            price_timeout: Duration::from_millis(parse_env("PRICE_TIMEOUT_MS", 5000)),
            notify_webhook_url: optional_env("NOTIFY_WEBHOOK_URL"),
            engine,
            queue,
            strategy,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
