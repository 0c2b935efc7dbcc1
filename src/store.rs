//! Downstream persistence: the idempotent bulk-write contract and its
//! PostgreSQL and in-process implementations.

pub mod error;
pub mod memory;
pub mod postgres;

use crate::fetch::records::{BlockRecord, LogRecord, TxRecord};
use async_trait::async_trait;
use self::error::StoreError;

/// The write contract every backend honors: persist all three record
/// arrays atomically, as one transaction, idempotently.
///
/// Saving the same records twice leaves the store unchanged. A block-number
/// collision with a *different* hash is a chain reorganization and fails
/// the whole save with [`StoreError::ReorgDetected`]; nothing is silently
/// overwritten.
#[async_trait]
pub trait BlockWriter: Send + Sync {
    async fn save(
        &self,
        blocks: &[BlockRecord],
        txs: &[TxRecord],
        logs: &[LogRecord],
    ) -> Result<(), StoreError>;
}
