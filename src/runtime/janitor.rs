//! Janitor: scans the in-flight list on a fixed cadence and returns every
//! range whose lease has expired to the pending queue. This is the only
//! path by which a crash without acknowledgement gets recovered. Multiple
//! janitors are safe; the conditional server-side move prevents
//! double-recovery.

use crate::coord::queue::WorkQueue;
use crate::runtime::telemetry::Telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct Janitor {
    queue: Arc<WorkQueue>,
    telemetry: Arc<Telemetry>,
    period: Duration,
    shutdown: CancellationToken,
}

impl Janitor {
    pub fn new(
        queue: Arc<WorkQueue>,
        telemetry: Arc<Telemetry>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            telemetry,
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

        tracing::info!("janitor stopped");
    }

    async fn tick(&self) {
        match self.queue.recover_zombies().await {
            Ok(recovered) if recovered.is_empty() => {
                tracing::trace!("no zombie ranges found");
            }
            Ok(recovered) => {
                self.telemetry
                    .record_zombies_recovered(recovered.len() as u64);
                let ranges: Vec<String> =
                    recovered.iter().map(|range| range.to_string()).collect();
                tracing::warn!(
                    count = recovered.len(),
                    ranges = ?ranges,
                    "recovered zombie ranges back to pending"
                );
            }
            Err(err) => {
                tracing::warn!(error = %err, "zombie recovery failed; will retry next tick");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::memory::MemoryCoord;

    #[tokio::test]
    async fn janitor_recovers_expired_leases() {
        let queue = Arc::new(WorkQueue::new(
            Arc::new(MemoryCoord::new()),
            5,
            0,
            Duration::from_millis(40),
        ));
        queue.seed(4).await.unwrap();

        // A worker takes the range, then silently dies.
        let mut handle = queue.take_handle().await.unwrap();
        queue
            .next(&mut handle, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();

        let telemetry = Arc::new(Telemetry::default());
        let shutdown = CancellationToken::new();
        let janitor = Janitor::new(
            queue.clone(),
            telemetry.clone(),
            Duration::from_millis(20),
            shutdown.clone(),
        );
        let task = tokio::spawn(janitor.run());

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        task.await.unwrap();

        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.pending, 1);
        assert_eq!(depth.in_flight, 0);
        assert_eq!(telemetry.snapshot().zombies_recovered, 1);
    }
}
