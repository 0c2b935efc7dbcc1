//! Global request-rate limiter backed by a sliding-window log in the
//! coordination store. Admission is decided atomically server-side; every
//! caller across every worker process draws from the same budget.
//!
//! Strict semantics: over any interval of one window length, at most
//! `limit` admissions occur. A fixed-window counter would admit up to
//! twice the limit at a window boundary; the log does not.

use crate::coord::store::CoordStore;
use crate::runtime::telemetry::Telemetry;
use anyhow::{bail, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub const RATE_LIMIT_KEY: &str = "ratelimit:global";

/// Rejected callers sleep a uniformly random interval in this band before
/// probing again, so synchronized workers spread back out.
const RETRY_SLEEP_MIN_MS: u64 = 50;
const RETRY_SLEEP_MAX_MS: u64 = 250;

pub struct RateLimiter {
    store: Arc<dyn CoordStore>,
    limit: u64,
    window: Duration,
    telemetry: Arc<Telemetry>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CoordStore>,
        limit: u64,
        window: Duration,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            store,
            limit: limit.max(1),
            window,
            telemetry,
        }
    }

    /// Block until a request slot is admitted. There is no retry cap: the
    /// limiter is flow control, not a failure source. Aborts only when the
    /// shutdown token fires or the coordination store errors.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                bail!("rate limit acquisition cancelled");
            }
            if self.try_acquire().await? {
                return Ok(());
            }
            self.telemetry.record_rate_limit_rejection();

            let jitter = rand::thread_rng().gen_range(RETRY_SLEEP_MIN_MS..=RETRY_SLEEP_MAX_MS);
            tokio::select! {
                _ = cancel.cancelled() => bail!("rate limit acquisition cancelled"),
                _ = sleep(Duration::from_millis(jitter)) => {}
            }
        }
    }

    /// Single admission probe, no sleeping. Each probe submits a fresh
    /// unique member so two calls landing on the same coordinator
    /// millisecond are both counted.
    pub async fn try_acquire(&self) -> Result<bool> {
        let member = format!("{:032x}", rand::random::<u128>());
        self.store
            .window_admit(RATE_LIMIT_KEY, self.limit, self.window, &member)
            .await
    }
}
