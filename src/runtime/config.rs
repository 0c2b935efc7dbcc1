use anyhow::{bail, Context, Result};
use std::time::Duration;

const DEFAULT_BATCH_SIZE: u64 = 20;
const DEFAULT_LEASE_TTL_SECS: u64 = 300;
const DEFAULT_MIN_BLOCK: u64 = 0;
const DEFAULT_RPC_RATE_LIMIT: u64 = 50;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_MAX_CONCURRENT_BLOCKS: usize = 10;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 20;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_TAKE_POLL_SECS: u64 = 5;
const DEFAULT_SEED_INTERVAL_SECS: u64 = 10;
const DEFAULT_JANITOR_INTERVAL_SECS: u64 = 10;
const DEFAULT_STORE_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_FAILURE_PAUSE_MS: u64 = 2_000;
const DEFAULT_FETCH_BACKOFF_BASE_MS: u64 = 500;

/// The sliding window the global request budget is measured over.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

/// Runtime configuration for the indexer deployment.
///
/// All instances must be constructed via [`IndexerConfig::builder`] or
/// [`IndexerConfig::from_env`] so invariants are validated before any
/// consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerConfig {
    redis_url: String,
    database_url: String,
    rpc_url: String,
    batch_size: u64,
    lease_ttl: Duration,
    min_block: u64,
    rpc_rate_limit: u64,
    max_retries: u32,
    worker_count: usize,
    max_concurrent_blocks: usize,
    rpc_timeout: Duration,
    heartbeat_interval: Duration,
    take_poll_interval: Duration,
    seed_interval: Duration,
    janitor_interval: Duration,
    metrics_interval: Duration,
    store_max_connections: u32,
    failure_pause: Duration,
    fetch_backoff_base: Duration,
}

impl IndexerConfig {
    pub fn builder() -> IndexerConfigBuilder {
        IndexerConfigBuilder::default()
    }

    /// Builds a configuration from `BLOCKSINK_*` environment variables,
    /// falling back to the documented defaults for everything optional.
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::builder()
            .redis_url(require_env("BLOCKSINK_REDIS_URL")?)
            .database_url(require_env("BLOCKSINK_DATABASE_URL")?)
            .rpc_url(require_env("BLOCKSINK_RPC_URL")?);

        if let Some(value) = parse_env::<u64>("BLOCKSINK_BATCH_SIZE")? {
            builder = builder.batch_size(value);
        }
        if let Some(value) = parse_env::<u64>("BLOCKSINK_LEASE_TTL_SECS")? {
            builder = builder.lease_ttl(Duration::from_secs(value));
        }
        if let Some(value) = parse_env::<u64>("BLOCKSINK_MIN_BLOCK")? {
            builder = builder.min_block(value);
        }
        if let Some(value) = parse_env::<u64>("BLOCKSINK_RPC_RATE_LIMIT")? {
            builder = builder.rpc_rate_limit(value);
        }
        if let Some(value) = parse_env::<u32>("BLOCKSINK_MAX_RETRIES")? {
            builder = builder.max_retries(value);
        }
        if let Some(value) = parse_env::<usize>("BLOCKSINK_WORKER_COUNT")? {
            builder = builder.worker_count(value);
        }
        if let Some(value) = parse_env::<usize>("BLOCKSINK_MAX_CONCURRENT_BLOCKS")? {
            builder = builder.max_concurrent_blocks(value);
        }
        if let Some(value) = parse_env::<u64>("BLOCKSINK_RPC_TIMEOUT_SECS")? {
            builder = builder.rpc_timeout(Duration::from_secs(value));
        }
        if let Some(value) = parse_env::<u32>("BLOCKSINK_STORE_MAX_CONNECTIONS")? {
            builder = builder.store_max_connections(value);
        }

        builder.build()
    }

    pub fn redis_url(&self) -> &str {
        &self.redis_url
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Blocks per range handed to a worker.
    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// How long a worker owns a range before the janitor may reclaim it.
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Seeding floor when no enqueued watermark exists yet.
    pub fn min_block(&self) -> u64 {
        self.min_block
    }

    /// Global RPC budget, in calls per [`RATE_LIMIT_WINDOW`].
    pub fn rpc_rate_limit(&self) -> u64 {
        self.rpc_rate_limit
    }

    /// Per-block fetch attempts before the range fails.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Per-worker bound on concurrent block fetches within a range.
    pub fn max_concurrent_blocks(&self) -> usize {
        self.max_concurrent_blocks
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Bound on each blocking take, so stop flags are observed promptly.
    pub fn take_poll_interval(&self) -> Duration {
        self.take_poll_interval
    }

    pub fn seed_interval(&self) -> Duration {
        self.seed_interval
    }

    pub fn janitor_interval(&self) -> Duration {
        self.janitor_interval
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn store_max_connections(&self) -> u32 {
        self.store_max_connections
    }

    /// Pause after a failed range before leasing the next one.
    pub fn failure_pause(&self) -> Duration {
        self.failure_pause
    }

    /// Base delay of the per-block fetch retry backoff.
    pub fn fetch_backoff_base(&self) -> Duration {
        self.fetch_backoff_base
    }

    pub fn validate(&self) -> Result<()> {
        validate_scheme(&self.redis_url, "redis_url", &["redis://", "rediss://"])?;
        validate_scheme(
            &self.database_url,
            "database_url",
            &["postgres://", "postgresql://"],
        )?;
        validate_scheme(&self.rpc_url, "rpc_url", &["http://", "https://"])?;

        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }
        if self.lease_ttl.is_zero() {
            bail!("lease_ttl must be greater than 0");
        }
        if self.rpc_rate_limit == 0 {
            bail!("rpc_rate_limit must be greater than 0");
        }
        if self.max_retries == 0 {
            bail!("max_retries must be greater than 0");
        }
        if self.worker_count == 0 {
            bail!("worker_count must be greater than 0");
        }
        if self.max_concurrent_blocks == 0 {
            bail!("max_concurrent_blocks must be greater than 0");
        }
        if self.rpc_timeout.is_zero() {
            bail!("rpc_timeout must be greater than 0");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval must be greater than 0");
        }
        if self.take_poll_interval.is_zero() {
            bail!("take_poll_interval must be greater than 0");
        }
        if self.seed_interval.is_zero() {
            bail!("seed_interval must be greater than 0");
        }
        if self.janitor_interval.is_zero() {
            bail!("janitor_interval must be greater than 0");
        }
        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }
        if self.store_max_connections == 0 {
            bail!("store_max_connections must be greater than 0");
        }

        // A slow RPC call must never outlive its lease: the heartbeat has
        // to land at least once while the longest possible call runs.
        let lease_budget = self
            .lease_ttl
            .checked_sub(self.heartbeat_interval)
            .unwrap_or(Duration::ZERO);
        if self.rpc_timeout >= lease_budget {
            bail!(
                "rpc_timeout ({:?}) must be less than lease_ttl minus heartbeat_interval ({:?})",
                self.rpc_timeout,
                lease_budget,
            );
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct IndexerConfigBuilder {
    redis_url: Option<String>,
    database_url: Option<String>,
    rpc_url: Option<String>,
    batch_size: Option<u64>,
    lease_ttl: Option<Duration>,
    min_block: Option<u64>,
    rpc_rate_limit: Option<u64>,
    max_retries: Option<u32>,
    worker_count: Option<usize>,
    max_concurrent_blocks: Option<usize>,
    rpc_timeout: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    take_poll_interval: Option<Duration>,
    seed_interval: Option<Duration>,
    janitor_interval: Option<Duration>,
    metrics_interval: Option<Duration>,
    store_max_connections: Option<u32>,
    failure_pause: Option<Duration>,
    fetch_backoff_base: Option<Duration>,
}

impl IndexerConfigBuilder {
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn batch_size(mut self, blocks: u64) -> Self {
        self.batch_size = Some(blocks);
        self
    }

    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    pub fn min_block(mut self, height: u64) -> Self {
        self.min_block = Some(height);
        self
    }

    pub fn rpc_rate_limit(mut self, calls_per_window: u64) -> Self {
        self.rpc_rate_limit = Some(calls_per_window);
        self
    }

    pub fn max_retries(mut self, attempts: u32) -> Self {
        self.max_retries = Some(attempts);
        self
    }

    pub fn worker_count(mut self, workers: usize) -> Self {
        self.worker_count = Some(workers);
        self
    }

    pub fn max_concurrent_blocks(mut self, blocks: usize) -> Self {
        self.max_concurrent_blocks = Some(blocks);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn take_poll_interval(mut self, interval: Duration) -> Self {
        self.take_poll_interval = Some(interval);
        self
    }

    pub fn seed_interval(mut self, interval: Duration) -> Self {
        self.seed_interval = Some(interval);
        self
    }

    pub fn janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = Some(interval);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn store_max_connections(mut self, connections: u32) -> Self {
        self.store_max_connections = Some(connections);
        self
    }

    pub fn failure_pause(mut self, pause: Duration) -> Self {
        self.failure_pause = Some(pause);
        self
    }

    pub fn fetch_backoff_base(mut self, base: Duration) -> Self {
        self.fetch_backoff_base = Some(base);
        self
    }

    pub fn build(self) -> Result<IndexerConfig> {
        let config = IndexerConfig {
            redis_url: trimmed(self.redis_url.context("redis_url is required")?),
            database_url: trimmed(self.database_url.context("database_url is required")?),
            rpc_url: trimmed(self.rpc_url.context("rpc_url is required")?),
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            lease_ttl: self
                .lease_ttl
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_LEASE_TTL_SECS)),
            min_block: self.min_block.unwrap_or(DEFAULT_MIN_BLOCK),
            rpc_rate_limit: self.rpc_rate_limit.unwrap_or(DEFAULT_RPC_RATE_LIMIT),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            worker_count: self.worker_count.unwrap_or(DEFAULT_WORKER_COUNT),
            max_concurrent_blocks: self
                .max_concurrent_blocks
                .unwrap_or(DEFAULT_MAX_CONCURRENT_BLOCKS),
            rpc_timeout: self
                .rpc_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS)),
            heartbeat_interval: self
                .heartbeat_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS)),
            take_poll_interval: self
                .take_poll_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_TAKE_POLL_SECS)),
            seed_interval: self
                .seed_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_SEED_INTERVAL_SECS)),
            janitor_interval: self
                .janitor_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_JANITOR_INTERVAL_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(crate::runtime::telemetry::DEFAULT_METRICS_INTERVAL),
            store_max_connections: self
                .store_max_connections
                .unwrap_or(DEFAULT_STORE_MAX_CONNECTIONS),
            failure_pause: self
                .failure_pause
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_FAILURE_PAUSE_MS)),
            fetch_backoff_base: self
                .fetch_backoff_base
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_FETCH_BACKOFF_BASE_MS)),
        };

        config.validate()?;
        Ok(config)
    }
}

fn trimmed(value: String) -> String {
    value.trim().to_owned()
}

fn validate_scheme(url: &str, field: &str, schemes: &[&str]) -> Result<()> {
    if url.is_empty() {
        bail!("{field} cannot be empty");
    }
    if !schemes.iter().any(|scheme| url.starts_with(scheme)) {
        bail!("{field} must start with one of {schemes:?}");
    }
    Ok(())
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("{name} holds an unparseable value {raw:?}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}
