//! Per-block extraction: acquire one rate-limit token per RPC call, issue
//! the block and receipt requests concurrently, join them into records, and
//! retry transient failures with exponential backoff and jitter.

use crate::coord::limiter::RateLimiter;
use crate::fetch::records::{assemble, FetchedBlock};
use crate::rpc::client::BlockRpc;
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const JITTER_MAX_MS: u64 = 500;

pub struct BlockFetcher {
    rpc: Arc<dyn BlockRpc>,
    limiter: Arc<RateLimiter>,
    telemetry: Arc<Telemetry>,
    max_attempts: u32,
    backoff_base: Duration,
}

impl BlockFetcher {
    pub fn new(
        rpc: Arc<dyn BlockRpc>,
        limiter: Arc<RateLimiter>,
        telemetry: Arc<Telemetry>,
        max_attempts: u32,
        backoff_base: Duration,
    ) -> Self {
        Self {
            rpc,
            limiter,
            telemetry,
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    /// Fetch one block and its receipts, normalized into flat records.
    ///
    /// Every RPC error is treated as transient here; after the final
    /// attempt the failure propagates and the caller decides the fate of
    /// the surrounding range.
    pub async fn fetch(&self, height: u64, cancel: &CancellationToken) -> Result<FetchedBlock> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_once(height, cancel).await {
                Ok(fetched) => {
                    self.telemetry.record_block_fetched();
                    return Ok(fetched);
                }
                Err(err) => {
                    attempt += 1;
                    if cancel.is_cancelled() || attempt >= self.max_attempts {
                        tracing::error!(
                            height,
                            attempt,
                            error = %err,
                            "block fetch exhausted retries"
                        );
                        return Err(err.context(format!(
                            "fetching block {height} failed after {attempt} attempts"
                        )));
                    }

                    let backoff = self.backoff_delay(attempt);
                    tracing::warn!(
                        height,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "block fetch failed; retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(err.context(format!(
                                "fetching block {height} cancelled during backoff"
                            )));
                        }
                        _ = sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn fetch_once(&self, height: u64, cancel: &CancellationToken) -> Result<FetchedBlock> {
        // The two calls run concurrently; each waits for its own token
        // first because each RPC call costs one unit of the global budget.
        let (block, receipts) = tokio::try_join!(
            async {
                self.limiter.acquire(cancel).await?;
                self.telemetry.record_rpc_call();
                self.rpc.block_by_number(height).await
            },
            async {
                self.limiter.acquire(cancel).await?;
                self.telemetry.record_rpc_call();
                self.rpc.block_receipts(height).await
            },
        )?;

        assemble(height, block, receipts)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exponential = self.backoff_base.saturating_mul(multiplier);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..JITTER_MAX_MS));
        exponential + jitter
    }
}
