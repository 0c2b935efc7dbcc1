//! Flat row images produced from one block's RPC responses, plus the
//! assembly step that joins transactions to their receipts.
//!
//! 256-bit quantities are carried as decimal strings end to end so no
//! precision is lost between the node and the `numeric(78,0)` columns.

use crate::rpc::client::RpcError;
use crate::rpc::helpers::{hex_to_decimal, hex_to_u64};
use crate::rpc::types::{RpcBlock, RpcReceipt};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: DateTime<Utc>,
    pub miner: Option<String>,
    pub gas_used: String,
    pub gas_limit: String,
    pub base_fee_per_gas: Option<String>,
    pub tx_count: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxRecord {
    pub hash: String,
    pub block_number: u64,
    pub tx_index: i32,
    pub from_address: String,
    pub to_address: Option<String>,
    pub value: String,
    pub gas: String,
    pub gas_price: Option<String>,
    pub nonce: u64,
    pub input: String,
    pub status: Option<i16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub transaction_hash: String,
    pub log_index: i32,
    pub block_number: u64,
    pub address: String,
    pub data: String,
    pub topic0: Option<String>,
    pub topic1: Option<String>,
    pub topic2: Option<String>,
    pub topic3: Option<String>,
}

/// Everything extracted from one block, ready for bulk persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBlock {
    pub block: BlockRecord,
    pub transactions: Vec<TxRecord>,
    pub logs: Vec<LogRecord>,
}

/// Join a block with its receipts and project both into flat records.
///
/// Every transaction must have a receipt; a missing one means the node
/// served inconsistent data and the whole block is rejected. The
/// transformation is deterministic: the same inputs always produce
/// field-identical records.
pub fn assemble(height: u64, block: RpcBlock, receipts: Vec<RpcReceipt>) -> Result<FetchedBlock> {
    let number = hex_to_u64(&block.number).context("block number is malformed")?;
    if number != height {
        bail!("requested block {height} but node returned block {number}");
    }

    let timestamp_secs = hex_to_u64(&block.timestamp).context("block timestamp is malformed")?;
    let timestamp = DateTime::from_timestamp(timestamp_secs as i64, 0)
        .with_context(|| format!("block timestamp {timestamp_secs} is out of range"))?;

    let mut receipt_by_tx: HashMap<String, RpcReceipt> = receipts
        .into_iter()
        .map(|receipt| (receipt.transaction_hash.clone(), receipt))
        .collect();

    let block_record = BlockRecord {
        number,
        hash: block.hash.clone(),
        parent_hash: block.parent_hash.clone(),
        timestamp,
        miner: block.miner.clone(),
        gas_used: hex_to_decimal(&block.gas_used).context("block gasUsed is malformed")?,
        gas_limit: hex_to_decimal(&block.gas_limit).context("block gasLimit is malformed")?,
        base_fee_per_gas: block
            .base_fee_per_gas
            .as_deref()
            .map(hex_to_decimal)
            .transpose()
            .context("block baseFeePerGas is malformed")?,
        tx_count: block.transactions.len() as i32,
    };

    let mut transactions = Vec::with_capacity(block.transactions.len());
    let mut logs = Vec::new();

    for tx in &block.transactions {
        let receipt = receipt_by_tx.remove(&tx.hash).ok_or_else(|| {
            anyhow::Error::from(RpcError::InconsistentBlock {
                height,
                tx_hash: tx.hash.clone(),
            })
        })?;

        let status = receipt
            .status
            .as_deref()
            .map(hex_to_u64)
            .transpose()
            .with_context(|| format!("receipt status of {} is malformed", tx.hash))?
            .map(|value| value as i16);

        transactions.push(TxRecord {
            hash: tx.hash.clone(),
            block_number: number,
            tx_index: hex_to_u64(&tx.transaction_index)
                .with_context(|| format!("transaction index of {} is malformed", tx.hash))?
                as i32,
            from_address: tx.from.clone(),
            to_address: tx.to.clone(),
            value: hex_to_decimal(&tx.value)
                .with_context(|| format!("value of {} is malformed", tx.hash))?,
            gas: hex_to_decimal(&tx.gas)
                .with_context(|| format!("gas of {} is malformed", tx.hash))?,
            gas_price: tx
                .gas_price
                .as_deref()
                .map(hex_to_decimal)
                .transpose()
                .with_context(|| format!("gasPrice of {} is malformed", tx.hash))?,
            nonce: hex_to_u64(&tx.nonce)
                .with_context(|| format!("nonce of {} is malformed", tx.hash))?,
            input: tx.input.clone(),
            status,
        });

        for log in &receipt.logs {
            let mut topics = log.topics.iter().cloned();
            logs.push(LogRecord {
                transaction_hash: tx.hash.clone(),
                log_index: hex_to_u64(&log.log_index)
                    .with_context(|| format!("log index in {} is malformed", tx.hash))?
                    as i32,
                block_number: number,
                address: log.address.clone(),
                data: log.data.clone(),
                topic0: topics.next(),
                topic1: topics.next(),
                topic2: topics.next(),
                topic3: topics.next(),
            });
        }
    }

    Ok(FetchedBlock {
        block: block_record,
        transactions,
        logs,
    })
}
