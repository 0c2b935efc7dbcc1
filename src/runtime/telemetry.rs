use crate::coord::queue::WorkQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(10);

static SUBSCRIBER_INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the process-wide tracing subscriber.
///
/// Filtering follows `RUST_LOG` and defaults to `info` when the variable
/// is absent. Every entry point (binary, tests) may call this; only the
/// first call has any effect, and an already-installed subscriber wins.
pub fn init_tracing() {
    SUBSCRIBER_INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .try_init();
    });
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    blocks_fetched: AtomicU64,
    rpc_calls: AtomicU64,
    rate_limit_rejections: AtomicU64,
    ranges_completed: AtomicU64,
    ranges_failed: AtomicU64,
    zombies_recovered: AtomicU64,
}

impl Telemetry {
    pub fn record_block_fetched(&self) {
        self.blocks_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rpc_call(&self) {
        self.rpc_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_rejection(&self) {
        self.rate_limit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_range_completed(&self) {
        self.ranges_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_range_failed(&self) {
        self.ranges_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_zombies_recovered(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.zombies_recovered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn ranges_completed(&self) -> u64 {
        self.ranges_completed.load(Ordering::Relaxed)
    }

    pub fn ranges_failed(&self) -> u64 {
        self.ranges_failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            blocks_fetched: self.blocks_fetched.load(Ordering::Relaxed),
            rpc_calls: self.rpc_calls.load(Ordering::Relaxed),
            rate_limit_rejections: self.rate_limit_rejections.load(Ordering::Relaxed),
            ranges_completed: self.ranges_completed.load(Ordering::Relaxed),
            ranges_failed: self.ranges_failed.load(Ordering::Relaxed),
            zombies_recovered: self.zombies_recovered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TelemetrySnapshot {
    pub blocks_fetched: u64,
    pub rpc_calls: u64,
    pub rate_limit_rejections: u64,
    pub ranges_completed: u64,
    pub ranges_failed: u64,
    pub zombies_recovered: u64,
}

/// Spawns a background task that periodically logs throughput, queue depth,
/// and rate-limit pressure.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    queue: Arc<WorkQueue>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_blocks = telemetry.snapshot().blocks_fetched;

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "blocksink::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot = telemetry.snapshot();
                    let delta = snapshot.blocks_fetched.saturating_sub(last_blocks);
                    last_blocks = snapshot.blocks_fetched;

                    let (pending, in_flight) = match queue.depth().await {
                        Ok(depth) => (depth.pending, depth.in_flight),
                        Err(err) => {
                            tracing::warn!(target: "blocksink::metrics", error = %err, "failed to read queue depth");
                            continue;
                        }
                    };

                    tracing::info!(
                        target: "blocksink::metrics",
                        blocks_fetched = snapshot.blocks_fetched,
                        blocks_since_last = delta,
                        rpc_calls = snapshot.rpc_calls,
                        rate_limit_rejections = snapshot.rate_limit_rejections,
                        ranges_completed = snapshot.ranges_completed,
                        ranges_failed = snapshot.ranges_failed,
                        zombies_recovered = snapshot.zombies_recovered,
                        queue_pending = pending,
                        queue_in_flight = in_flight,
                        "runtime metrics snapshot"
                    );
                }
            }
        }
    })
}
