//! In-process storage backend honoring the same write contract as the
//! PostgreSQL implementation: idempotent inserts, atomic per-save
//! application, and the reorg signal on a block-number collision with a
//! different hash. Used by the pipeline tests and ephemeral runs.

use crate::fetch::records::{BlockRecord, LogRecord, TxRecord};
use crate::store::error::StoreError;
use crate::store::BlockWriter;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct MemoryTables {
    blocks: BTreeMap<u64, BlockRecord>,
    transactions: HashMap<String, TxRecord>,
    logs: HashMap<(String, i32), LogRecord>,
}

#[derive(Default)]
pub struct MemoryBlockStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.tables.lock().expect("store poisoned").blocks.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.tables
            .lock()
            .expect("store poisoned")
            .transactions
            .len()
    }

    pub fn log_count(&self) -> usize {
        self.tables.lock().expect("store poisoned").logs.len()
    }

    pub fn block(&self, number: u64) -> Option<BlockRecord> {
        self.tables
            .lock()
            .expect("store poisoned")
            .blocks
            .get(&number)
            .cloned()
    }

    /// All persisted heights in ascending order.
    pub fn heights(&self) -> Vec<u64> {
        self.tables
            .lock()
            .expect("store poisoned")
            .blocks
            .keys()
            .copied()
            .collect()
    }
}

#[async_trait]
impl BlockWriter for MemoryBlockStore {
    async fn save(
        &self,
        blocks: &[BlockRecord],
        txs: &[TxRecord],
        logs: &[LogRecord],
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().expect("store poisoned");

        // Validate the whole batch before touching anything so a rejected
        // save leaves the store exactly as it was, like a rolled-back
        // transaction.
        for block in blocks {
            if let Some(existing) = tables.blocks.get(&block.number) {
                if existing.hash != block.hash {
                    return Err(StoreError::ReorgDetected {
                        number: Some(block.number),
                    });
                }
            }
        }

        for block in blocks {
            tables.blocks.entry(block.number).or_insert_with(|| block.clone());
        }
        for tx in txs {
            tables
                .transactions
                .entry(tx.hash.clone())
                .or_insert_with(|| tx.clone());
        }
        for log in logs {
            tables
                .logs
                .entry((log.transaction_hash.clone(), log.log_index))
                .or_insert_with(|| log.clone());
        }
        Ok(())
    }
}
