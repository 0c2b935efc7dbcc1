//! Worker loop: lease a range, fan out per-block fetches under a bounded
//! concurrency limit, persist the results atomically, and acknowledge or
//! fail the lease.
//!
//! State machine per iteration:
//! IDLE -> (next) -> LEASED -> (fetch + persist) -> ACK -> IDLE, with any
//! failure inside the range routing through FAIL instead of ACK. A
//! heartbeat task extends the lease while the range is being processed.

use crate::coord::queue::{BlockRange, WorkQueue};
use crate::fetch::fetcher::BlockFetcher;
use crate::fetch::records::FetchedBlock;
use crate::runtime::telemetry::Telemetry;
use crate::store::error::StoreError;
use crate::store::BlockWriter;
use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct WorkerParams {
    pub id: usize,
    pub queue: Arc<WorkQueue>,
    pub fetcher: Arc<BlockFetcher>,
    pub writer: Arc<dyn BlockWriter>,
    pub telemetry: Arc<Telemetry>,
    pub shutdown: CancellationToken,
    pub max_concurrent_blocks: usize,
    pub heartbeat_interval: Duration,
    pub take_poll_interval: Duration,
    pub failure_pause: Duration,
}

pub struct Worker {
    id: usize,
    queue: Arc<WorkQueue>,
    fetcher: Arc<BlockFetcher>,
    writer: Arc<dyn BlockWriter>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    max_concurrent_blocks: usize,
    heartbeat_interval: Duration,
    take_poll_interval: Duration,
    failure_pause: Duration,
}

enum RangeOutcome {
    Completed,
    Failed,
}

impl Worker {
    pub fn new(params: WorkerParams) -> Self {
        Self {
            id: params.id,
            queue: params.queue,
            fetcher: params.fetcher,
            writer: params.writer,
            telemetry: params.telemetry,
            shutdown: params.shutdown,
            max_concurrent_blocks: params.max_concurrent_blocks.max(1),
            heartbeat_interval: params.heartbeat_interval,
            take_poll_interval: params.take_poll_interval,
            failure_pause: params.failure_pause,
        }
    }

    /// Run until shutdown. Returns an error only on conditions the worker
    /// must not survive: a detected reorg, or failure to establish its
    /// dedicated take connection. Everything else is logged, the range (if
    /// any) is failed back into the queue, and the loop continues. An
    /// abandoned lease is always recovered by the janitor, so dying here
    /// never strands work.
    #[tracing::instrument(name = "worker", skip_all, fields(worker = self.id))]
    pub async fn run(self) -> Result<()> {
        tracing::info!("worker task started");
        let mut take_handle = self
            .queue
            .take_handle()
            .await
            .context("worker could not open its take connection")?;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let taken = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                taken = self.queue.next(&mut take_handle, self.take_poll_interval) => taken,
            };

            let range = match taken {
                Ok(Some(range)) => range,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(error = %err, "failed to lease next range; backing off");
                    self.pause().await;
                    continue;
                }
            };

            tracing::info!(range = %range, "range leased");
            match self.process_range(range).await {
                Ok(RangeOutcome::Completed) => {}
                Ok(RangeOutcome::Failed) => self.pause().await,
                Err(err) => {
                    if is_reorg(&err) {
                        tracing::error!(range = %range, error = %err, "reorg detected; stopping worker");
                        return Err(err);
                    }
                    tracing::error!(range = %range, error = %err, "range settlement failed; backing off");
                    self.pause().await;
                }
            }
        }

        tracing::info!("worker task exited");
        Ok(())
    }

    async fn process_range(&self, range: BlockRange) -> Result<RangeOutcome> {
        let heartbeat = self.spawn_heartbeat(range);

        let result = match self.fetch_range(range).await {
            Ok(fetched) => self.persist(range, fetched).await,
            Err(err) => Err(err),
        };

        heartbeat.stop().await;

        match result {
            Ok(()) => {
                self.queue
                    .complete(range)
                    .await
                    .with_context(|| format!("failed to acknowledge range {range}"))?;
                self.telemetry.record_range_completed();
                tracing::info!(range = %range, "range persisted and acknowledged");
                Ok(RangeOutcome::Completed)
            }
            Err(err) => {
                let reorg = is_reorg(&err);
                self.queue
                    .fail(range)
                    .await
                    .with_context(|| format!("failed to re-queue range {range}"))?;
                self.telemetry.record_range_failed();
                if reorg {
                    Err(err)
                } else {
                    tracing::warn!(range = %range, error = %err, "range failed; re-queued at tail");
                    Ok(RangeOutcome::Failed)
                }
            }
        }
    }

    /// One task per height, all gated by the bounded limiter. Waits for
    /// every task, then propagates the first failure: a single block with
    /// exhausted retries fails the whole range.
    async fn fetch_range(&self, range: BlockRange) -> Result<Vec<FetchedBlock>> {
        let limiter = Arc::new(Semaphore::new(self.max_concurrent_blocks));
        let mut tasks = Vec::with_capacity(range.block_count() as usize);

        for height in range.heights() {
            let limiter = limiter.clone();
            let fetcher = self.fetcher.clone();
            let cancel = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = limiter
                    .acquire_owned()
                    .await
                    .context("fetch concurrency limiter closed")?;
                fetcher.fetch(height, &cancel).await
            }));
        }

        let results = join_all(tasks).await;
        let mut fetched = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(Ok(block)) => fetched.push(block),
                Ok(Err(err)) => return Err(err),
                Err(join_err) => return Err(anyhow!("block fetch task panicked: {join_err}")),
            }
        }
        Ok(fetched)
    }

    async fn persist(&self, range: BlockRange, fetched: Vec<FetchedBlock>) -> Result<()> {
        let mut blocks = Vec::with_capacity(fetched.len());
        let mut txs = Vec::new();
        let mut logs = Vec::new();
        for item in fetched {
            blocks.push(item.block);
            txs.extend(item.transactions);
            logs.extend(item.logs);
        }

        tracing::debug!(
            range = %range,
            blocks = blocks.len(),
            transactions = txs.len(),
            logs = logs.len(),
            "persisting range"
        );
        self.writer
            .save(&blocks, &txs, &logs)
            .await
            .map_err(anyhow::Error::new)
    }

    fn spawn_heartbeat(&self, range: BlockRange) -> Heartbeat {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let queue = self.queue.clone();
        let period = self.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The interval fires immediately; the lease was just set.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        match queue.extend_lease(range).await {
                            Ok(true) => tracing::trace!(range = %range, "lease extended"),
                            Ok(false) => {
                                tracing::warn!(range = %range, "lease vanished before heartbeat");
                            }
                            Err(err) => {
                                tracing::warn!(range = %range, error = %err, "failed to extend lease");
                            }
                        }
                    }
                }
            }
        });

        Heartbeat { token, handle }
    }

    async fn pause(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = sleep(self.failure_pause) => {}
        }
    }
}

struct Heartbeat {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

fn is_reorg(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::ReorgDetected { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::limiter::RateLimiter;
    use crate::coord::memory::MemoryCoord;
    use crate::rpc::client::BlockRpc;
    use crate::rpc::types::{RpcBlock, RpcReceipt};
    use crate::store::memory::MemoryBlockStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Instant;

    /// Serves synthetic empty blocks; heights in `poisoned` always error.
    struct ScriptedRpc {
        tip: u64,
        poisoned: HashSet<u64>,
    }

    impl ScriptedRpc {
        fn new(tip: u64) -> Self {
            Self {
                tip,
                poisoned: HashSet::new(),
            }
        }

        fn with_poisoned(tip: u64, heights: &[u64]) -> Self {
            Self {
                tip,
                poisoned: heights.iter().copied().collect(),
            }
        }
    }

    #[async_trait]
    impl BlockRpc for ScriptedRpc {
        async fn block_number(&self) -> Result<u64> {
            Ok(self.tip)
        }

        async fn block_by_number(&self, height: u64) -> Result<RpcBlock> {
            if self.poisoned.contains(&height) {
                anyhow::bail!("height {height} permanently rejected");
            }
            Ok(RpcBlock {
                number: format!("{height:#x}"),
                hash: format!("0xhash{height}"),
                parent_hash: format!("0xhash{}", height.wrapping_sub(1)),
                timestamp: "0x1".into(),
                miner: None,
                gas_used: "0x0".into(),
                gas_limit: "0x1c9c380".into(),
                base_fee_per_gas: None,
                transactions: Vec::new(),
            })
        }

        async fn block_receipts(&self, height: u64) -> Result<Vec<RpcReceipt>> {
            if self.poisoned.contains(&height) {
                anyhow::bail!("height {height} permanently rejected");
            }
            Ok(Vec::new())
        }
    }

    struct Fixture {
        queue: Arc<WorkQueue>,
        store: Arc<MemoryBlockStore>,
        telemetry: Arc<Telemetry>,
        shutdown: CancellationToken,
    }

    fn fixture(rpc: Arc<dyn BlockRpc>, batch_size: u64) -> (Fixture, Worker) {
        let coord = Arc::new(MemoryCoord::new());
        let telemetry = Arc::new(Telemetry::default());
        let queue = Arc::new(WorkQueue::new(
            coord.clone(),
            batch_size,
            0,
            Duration::from_secs(60),
        ));
        let limiter = Arc::new(RateLimiter::new(
            coord,
            1_000,
            Duration::from_secs(1),
            telemetry.clone(),
        ));
        let fetcher = Arc::new(BlockFetcher::new(
            rpc,
            limiter,
            telemetry.clone(),
            2,
            Duration::from_millis(1),
        ));
        let store = Arc::new(MemoryBlockStore::new());
        let shutdown = CancellationToken::new();

        let worker = Worker::new(WorkerParams {
            id: 0,
            queue: queue.clone(),
            fetcher,
            writer: store.clone(),
            telemetry: telemetry.clone(),
            shutdown: shutdown.clone(),
            max_concurrent_blocks: 4,
            heartbeat_interval: Duration::from_millis(50),
            take_poll_interval: Duration::from_millis(20),
            failure_pause: Duration::from_millis(10),
        });

        (
            Fixture {
                queue,
                store,
                telemetry,
                shutdown,
            },
            worker,
        )
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) {
        let start = Instant::now();
        while !check() {
            if start.elapsed() > deadline {
                panic!("condition not reached within {deadline:?}");
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_drains_the_queue_and_advances_the_watermark() {
        let rpc = Arc::new(ScriptedRpc::new(9));
        let (fixture, worker) = fixture(rpc, 5);
        fixture.queue.seed(9).await.unwrap();

        let handle = tokio::spawn(worker.run());
        let store = fixture.store.clone();
        wait_until(Duration::from_secs(5), || store.block_count() == 10).await;
        let telemetry = fixture.telemetry.clone();
        wait_until(Duration::from_secs(5), || telemetry.ranges_completed() == 2).await;

        fixture.shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(fixture.store.heights(), (0..=9).collect::<Vec<_>>());
        assert_eq!(fixture.queue.last_processed().await.unwrap(), Some(9));
        let depth = fixture.queue.depth().await.unwrap();
        assert_eq!(depth.pending, 0);
        assert_eq!(depth.in_flight, 0);
        assert_eq!(fixture.telemetry.ranges_completed(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_range_is_requeued_and_does_not_block_others() {
        let rpc = Arc::new(ScriptedRpc::with_poisoned(20, &[3]));
        let (fixture, worker) = fixture(rpc, 4);
        // Ranges: 0-3 (poisoned by height 3), 4-7, 8-11.
        fixture.queue.seed(11).await.unwrap();

        let handle = tokio::spawn(worker.run());
        let telemetry = fixture.telemetry.clone();
        wait_until(Duration::from_secs(5), || telemetry.ranges_completed() >= 2).await;
        wait_until(Duration::from_secs(5), || telemetry.ranges_failed() >= 1).await;

        fixture.shutdown.cancel();
        handle.await.unwrap().unwrap();

        // The healthy ranges landed despite the poison range cycling.
        for height in 4..=11 {
            assert!(fixture.store.block(height).is_some());
        }
        assert!(fixture.store.block(3).is_none());
        assert_eq!(fixture.queue.last_processed().await.unwrap(), Some(11));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reorg_is_fatal_for_the_worker() {
        let rpc = Arc::new(ScriptedRpc::new(9));
        let (fixture, worker) = fixture(rpc, 5);

        // Pre-populate block 2 with a different hash than the node serves.
        let conflicting = crate::fetch::records::BlockRecord {
            number: 2,
            hash: "0xdifferent".into(),
            parent_hash: "0xhash1".into(),
            timestamp: chrono::DateTime::from_timestamp(1, 0).unwrap(),
            miner: None,
            gas_used: "0".into(),
            gas_limit: "30000000".into(),
            base_fee_per_gas: None,
            tx_count: 0,
        };
        fixture.store.save(&[conflicting], &[], &[]).await.unwrap();

        fixture.queue.seed(4).await.unwrap();
        let err = worker.run().await.expect_err("reorg must stop the worker");
        assert!(is_reorg(&err));

        // The range went back to pending rather than being lost.
        let depth = fixture.queue.depth().await.unwrap();
        assert_eq!(depth.pending, 1);
        assert_eq!(depth.in_flight, 0);
    }
}
