use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use blocksink::{IndexerConfig, IndexerConfigBuilder, WorkQueue};
use tokio::time::sleep;

/// The library's subscriber guard already makes repeat installation a
/// no-op, so every test can call this unconditionally.
pub fn init_tracing() {
    blocksink::init_tracing();
}

/// Config tuned for fast pipeline tests: millisecond cadences everywhere.
/// The coordination and store URLs are placeholders; pipeline tests inject
/// in-memory backends and only the knobs matter.
pub fn test_config(rpc_url: &str) -> IndexerConfigBuilder {
    IndexerConfig::builder()
        .redis_url("redis://unused.invalid:6379")
        .database_url("postgres://unused.invalid/blocksink")
        .rpc_url(rpc_url)
        .batch_size(5)
        .worker_count(1)
        .max_concurrent_blocks(4)
        .max_retries(2)
        .lease_ttl(Duration::from_secs(60))
        .rpc_timeout(Duration::from_secs(5))
        .heartbeat_interval(Duration::from_millis(100))
        .take_poll_interval(Duration::from_millis(20))
        .seed_interval(Duration::from_millis(30))
        .janitor_interval(Duration::from_millis(30))
        .metrics_interval(Duration::from_secs(5))
        .failure_pause(Duration::from_millis(20))
        .fetch_backoff_base(Duration::from_millis(5))
}

pub async fn wait_for_last_processed(
    queue: &Arc<WorkQueue>,
    target: u64,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        let current = queue.last_processed().await?;
        if current.is_some_and(|height| height >= target) {
            return Ok(());
        }
        if start.elapsed() > timeout {
            let reported = current
                .map(|height| height.to_string())
                .unwrap_or_else(|| "<none>".to_owned());
            bail!(
                "processed watermark did not reach {target} within {timeout:?} (at {reported})"
            );
        }
        sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for<F>(mut condition: F, timeout: Duration, what: &str) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("{what} did not happen within {timeout:?}");
        }
        sleep(Duration::from_millis(20)).await;
    }
}
