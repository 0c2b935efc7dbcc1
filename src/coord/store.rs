//! Coordination store adapter: the small set of atomic list, key, and
//! scripted operations every distributed primitive in this crate is built on.
//! Implementations carry no queue or rate-limit logic; they only guarantee
//! the atomicity of each individual operation.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// One command inside an atomic multi-command transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordOp {
    /// Append a value to the tail of a list.
    PushTail { list: String, value: String },
    /// Remove the first occurrence of a value from a list.
    ListRemove { list: String, value: String },
    /// Delete a key.
    KeyDelete { key: String },
}

/// A connection reserved exclusively for blocking head-to-tail moves.
///
/// The blocking take must never share a connection with non-blocking
/// commands: while the take is parked server-side the connection cannot
/// serve anything else. Callers obtain one handle per consumer loop via
/// [`CoordStore::take_handle`] and keep it for the lifetime of that loop.
#[async_trait]
pub trait TakeHandle: Send {
    /// Atomically move the head of `src` to the tail of `dst`, blocking up
    /// to `timeout`. Returns `None` when the timeout expires with `src`
    /// still empty, so callers can poll their stop flag between waits.
    async fn take(&mut self, src: &str, dst: &str, timeout: Duration) -> Result<Option<String>>;
}

/// Atomic operations exposed by the coordination service.
///
/// Connection errors propagate as-is; callers decide whether to retry.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Append values to the tail of a list, in order, as one round trip.
    async fn push_tail(&self, list: &str, values: &[String]) -> Result<()>;

    /// Establish a dedicated connection for blocking takes.
    async fn take_handle(&self) -> Result<Box<dyn TakeHandle>>;

    /// Execute `ops` as a single atomic transaction.
    async fn multi(&self, ops: &[CoordOp]) -> Result<()>;

    /// Set `key` to `value` with a time-to-live.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Reset the TTL of an existing key. Returns false when the key does
    /// not exist (already expired or never set).
    async fn refresh_ttl(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read an entire list front to back.
    async fn list_range(&self, list: &str) -> Result<Vec<String>>;

    async fn list_len(&self, list: &str) -> Result<usize>;

    /// Atomically remove one occurrence of `value` from `src` and, only if
    /// one was removed, append it to the tail of `dst`. Returns whether the
    /// move happened. Concurrent callers cannot both observe a removal, so
    /// the value is never duplicated into `dst` by racing recoverers.
    async fn move_if_member(&self, src: &str, dst: &str, value: &str) -> Result<bool>;

    /// Monotonic compare-and-set: store `candidate` only if it exceeds the
    /// current numeric value (or the key is unset). Returns the resulting
    /// value, evaluated atomically server-side.
    async fn set_max(&self, key: &str, candidate: u64) -> Result<u64>;

    /// Sliding-window-log admission, evaluated atomically server-side:
    /// evict entries older than `window`, count the remainder, and admit
    /// `member` with the coordinator's current clock as its score when the
    /// count is below `limit`. The key's TTL is reset to `window` on
    /// admission so idle logs clean themselves up. Only the coordinator's
    /// clock is consulted; caller clock skew is irrelevant.
    async fn window_admit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        member: &str,
    ) -> Result<bool>;
}
