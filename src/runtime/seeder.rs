//! Seeder: polls the chain tip on a fixed cadence and appends any newly
//! visible heights to the pending queue. One instance per deployment is
//! enough; extras are tolerated because seeding is idempotent through the
//! enqueued watermark, just wasteful.

use crate::coord::queue::WorkQueue;
use crate::rpc::client::BlockRpc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct Seeder {
    rpc: Arc<dyn BlockRpc>,
    queue: Arc<WorkQueue>,
    period: Duration,
    shutdown: CancellationToken,
}

impl Seeder {
    pub fn new(
        rpc: Arc<dyn BlockRpc>,
        queue: Arc<WorkQueue>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            rpc,
            queue,
            period,
            shutdown,
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        tracing::info!("seeder stopped");
    }

    async fn tick(&self) {
        let tip = match self.rpc.block_number().await {
            Ok(tip) => tip,
            Err(err) => {
                tracing::warn!(error = %err, "failed to query chain tip; skipping seed tick");
                return;
            }
        };

        match self.queue.seed(tip).await {
            Ok(0) => tracing::trace!(tip, "nothing new to seed"),
            Ok(ranges) => tracing::info!(tip, ranges, "seeded new ranges"),
            Err(err) => tracing::warn!(tip, error = %err, "failed to seed pending ranges"),
        }
    }
}
