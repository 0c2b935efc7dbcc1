//! Distributed work queue with per-range leases.
//!
//! Ranges travel between two lists: `queue:work` (pending, FIFO) and
//! `queue:processing` (in flight). A range in `processing` is owned by the
//! worker holding its lease key; a range in `processing` without a live
//! lease is a zombie and is returned to `work` by [`WorkQueue::recover_zombies`].
//! Two monotonic watermarks record progress: the highest height ever
//! enqueued and the highest height durably persisted.

use crate::coord::store::{CoordOp, CoordStore, TakeHandle};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const WORK_LIST: &str = "queue:work";
pub const PROCESSING_LIST: &str = "queue:processing";
pub const LAST_QUEUED_KEY: &str = "queue:lastQueued";
pub const LAST_PROCESSED_KEY: &str = "queue:lastProcessed";
const LEASE_PREFIX: &str = "lock:range:";

/// An inclusive interval of block heights, the unit of work assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Result<Self> {
        if from > to {
            bail!("invalid block range: {from} > {to}");
        }
        Ok(Self { from, to })
    }

    /// Number of heights covered, inclusive of both bounds.
    pub fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn heights(&self) -> impl Iterator<Item = u64> {
        self.from..=self.to
    }

    fn lease_key(&self) -> String {
        format!("{LEASE_PREFIX}{self}")
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

impl FromStr for BlockRange {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (from, to) = raw
            .split_once('-')
            .with_context(|| format!("malformed range entry {raw:?}"))?;
        let from = from
            .parse::<u64>()
            .with_context(|| format!("malformed range entry {raw:?}"))?;
        let to = to
            .parse::<u64>()
            .with_context(|| format!("malformed range entry {raw:?}"))?;
        Self::new(from, to)
    }
}

/// Pending and in-flight queue lengths, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    pub pending: usize,
    pub in_flight: usize,
}

pub struct WorkQueue {
    store: Arc<dyn CoordStore>,
    batch_size: u64,
    min_block: u64,
    lease_ttl: Duration,
}

impl WorkQueue {
    pub fn new(
        store: Arc<dyn CoordStore>,
        batch_size: u64,
        min_block: u64,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            min_block,
            lease_ttl,
        }
    }

    /// Append every not-yet-enqueued range up to `target` (inclusive) and
    /// advance the enqueued watermark. Returns the number of ranges
    /// appended; zero when the watermark already covers `target`.
    ///
    /// Idempotent across restarts and concurrent seeders: the watermark
    /// only ever advances, and re-seeding an already-covered interval is a
    /// no-op.
    pub async fn seed(&self, target: u64) -> Result<usize> {
        let start = match self.last_queued().await? {
            Some(queued) => queued.saturating_add(1),
            None => self.min_block,
        };
        if start > target {
            return Ok(0);
        }

        let mut entries = Vec::new();
        let mut from = start;
        while from <= target {
            let to = target.min(from + self.batch_size - 1);
            entries.push(BlockRange { from, to }.to_string());
            from = to + 1;
        }

        self.store.push_tail(WORK_LIST, &entries).await?;
        self.store.set_max(LAST_QUEUED_KEY, target).await?;

        tracing::debug!(
            start,
            target,
            ranges = entries.len(),
            "appended pending ranges"
        );
        Ok(entries.len())
    }

    /// Open a dedicated blocking-take connection for one consumer loop.
    pub async fn take_handle(&self) -> Result<Box<dyn TakeHandle>> {
        self.store.take_handle().await
    }

    /// Lease the next pending range: atomically move the head of `work` to
    /// the tail of `processing`, then set the lease key. Returns `None`
    /// when nothing arrived within `timeout`.
    ///
    /// The lease is set as a second command after the move. A crash inside
    /// that window leaves a lease-less range in `processing`, which is
    /// exactly what [`Self::recover_zombies`] repairs.
    pub async fn next(
        &self,
        handle: &mut Box<dyn TakeHandle>,
        timeout: Duration,
    ) -> Result<Option<BlockRange>> {
        let Some(raw) = handle.take(WORK_LIST, PROCESSING_LIST, timeout).await? else {
            return Ok(None);
        };
        let range = raw
            .parse::<BlockRange>()
            .with_context(|| format!("pending queue produced unparseable entry {raw:?}"))?;
        self.store
            .set_with_ttl(&range.lease_key(), "1", self.lease_ttl)
            .await?;
        Ok(Some(range))
    }

    /// Heartbeat: push the lease deadline out by a full TTL. Returns false
    /// when the lease no longer exists (expired, or the range settled).
    pub async fn extend_lease(&self, range: BlockRange) -> Result<bool> {
        self.store
            .refresh_ttl(&range.lease_key(), self.lease_ttl)
            .await
    }

    /// Acknowledge a persisted range: atomically drop it from `processing`
    /// and release the lease, then advance the processed watermark.
    pub async fn complete(&self, range: BlockRange) -> Result<()> {
        self.store
            .multi(&[
                CoordOp::ListRemove {
                    list: PROCESSING_LIST.into(),
                    value: range.to_string(),
                },
                CoordOp::KeyDelete {
                    key: range.lease_key(),
                },
            ])
            .await?;
        self.store.set_max(LAST_PROCESSED_KEY, range.to).await?;
        Ok(())
    }

    /// Return a failed range to the tail of `work` and release its lease.
    /// The tail placement keeps one stuck range from head-of-line blocking
    /// every other range.
    pub async fn fail(&self, range: BlockRange) -> Result<()> {
        self.store
            .multi(&[
                CoordOp::ListRemove {
                    list: PROCESSING_LIST.into(),
                    value: range.to_string(),
                },
                CoordOp::KeyDelete {
                    key: range.lease_key(),
                },
                CoordOp::PushTail {
                    list: WORK_LIST.into(),
                    value: range.to_string(),
                },
            ])
            .await
    }

    /// Scan `processing` for ranges whose lease has expired and move each
    /// back to `work`. The move is conditional server-side, so concurrent
    /// janitors never recover the same occurrence twice. Returns the ranges
    /// this caller recovered.
    pub async fn recover_zombies(&self) -> Result<Vec<BlockRange>> {
        let in_flight = self.store.list_range(PROCESSING_LIST).await?;
        let mut recovered = Vec::new();

        for raw in in_flight {
            let range = match raw.parse::<BlockRange>() {
                Ok(range) => range,
                Err(error) => {
                    tracing::warn!(entry = %raw, error = %error, "purging unparseable in-flight entry");
                    self.store
                        .multi(&[CoordOp::ListRemove {
                            list: PROCESSING_LIST.into(),
                            value: raw,
                        }])
                        .await?;
                    continue;
                }
            };

            if self.store.exists(&range.lease_key()).await? {
                continue;
            }
            if self
                .store
                .move_if_member(PROCESSING_LIST, WORK_LIST, &raw)
                .await?
            {
                recovered.push(range);
            }
        }

        Ok(recovered)
    }

    pub async fn last_queued(&self) -> Result<Option<u64>> {
        read_watermark(self.store.as_ref(), LAST_QUEUED_KEY).await
    }

    pub async fn last_processed(&self) -> Result<Option<u64>> {
        read_watermark(self.store.as_ref(), LAST_PROCESSED_KEY).await
    }

    pub async fn depth(&self) -> Result<QueueDepth> {
        Ok(QueueDepth {
            pending: self.store.list_len(WORK_LIST).await?,
            in_flight: self.store.list_len(PROCESSING_LIST).await?,
        })
    }
}

async fn read_watermark(store: &dyn CoordStore, key: &str) -> Result<Option<u64>> {
    match store.get(key).await? {
        Some(raw) => {
            let value = raw
                .parse::<u64>()
                .with_context(|| format!("watermark {key} holds non-numeric value {raw:?}"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}
