//! RPC client implementation for fetching EVM blocks and receipts from a
//! JSON-RPC node. Houses the `EthRpcClient`, error types, and the
//! `BlockRpc` trait consumed by the fetcher.

use crate::rpc::helpers::{height_to_hex, hex_to_u64};
use crate::rpc::options::RpcClientOptions;
use crate::rpc::types::{RpcBlock, RpcReceipt};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use tokio::time::timeout;

#[derive(Debug)]
pub enum RpcError {
    Timeout { method: &'static str },
    BlockNotFound { height: u64 },
    InconsistentBlock { height: u64, tx_hash: String },
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Timeout { method } => write!(f, "rpc method {method} timed out"),
            RpcError::BlockNotFound { height } => {
                write!(f, "node returned no block at height {height}")
            }
            RpcError::InconsistentBlock { height, tx_hash } => write!(
                f,
                "node returned block {height} without a receipt for transaction {tx_hash}"
            ),
        }
    }
}

impl std::error::Error for RpcError {}

/// The three upstream calls the indexer needs, behind a seam so the fetcher
/// can be exercised against a scripted double.
#[async_trait]
pub trait BlockRpc: Send + Sync {
    /// Current chain tip height (`eth_blockNumber`).
    async fn block_number(&self) -> Result<u64>;

    /// Block with full transaction objects (`eth_getBlockByNumber`).
    async fn block_by_number(&self, height: u64) -> Result<RpcBlock>;

    /// All receipts of a block (`eth_getBlockReceipts`).
    async fn block_receipts(&self, height: u64) -> Result<Vec<RpcReceipt>>;
}

#[derive(Debug, Clone)]
pub struct EthRpcClient {
    client: HttpClient,
    options: RpcClientOptions,
}

impl EthRpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_options(url, RpcClientOptions::default())
    }

    pub fn with_options(url: impl Into<String>, options: RpcClientOptions) -> Result<Self> {
        options.validate()?;
        let url = url.into();

        let client = HttpClientBuilder::default()
            .request_timeout(options.request_timeout)
            .max_request_size(options.max_request_body_bytes)
            .max_response_size(options.max_response_body_bytes)
            .build(&url)
            .map_err(|err| anyhow!("failed to build RPC client for {url}: {err}"))?;

        Ok(Self { client, options })
    }

    async fn request<R: serde::de::DeserializeOwned>(
        &self,
        method: &'static str,
        params: jsonrpsee::core::params::ArrayParams,
    ) -> Result<R> {
        timeout(
            self.options.request_timeout,
            self.client.request::<R, _>(method, params),
        )
        .await
        .map_err(|_| RpcError::Timeout { method })?
        .with_context(|| format!("rpc {method} call failed"))
    }
}

#[async_trait]
impl BlockRpc for EthRpcClient {
    async fn block_number(&self) -> Result<u64> {
        let raw: String = self.request("eth_blockNumber", rpc_params![]).await?;
        hex_to_u64(&raw).context("eth_blockNumber returned a malformed quantity")
    }

    async fn block_by_number(&self, height: u64) -> Result<RpcBlock> {
        let block: Option<RpcBlock> = self
            .request(
                "eth_getBlockByNumber",
                rpc_params![height_to_hex(height), true],
            )
            .await?;
        block.ok_or_else(|| RpcError::BlockNotFound { height }.into())
    }

    async fn block_receipts(&self, height: u64) -> Result<Vec<RpcReceipt>> {
        let receipts: Option<Vec<RpcReceipt>> = self
            .request("eth_getBlockReceipts", rpc_params![height_to_hex(height)])
            .await?;
        receipts.ok_or_else(|| RpcError::BlockNotFound { height }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_their_context() {
        let timeout = RpcError::Timeout {
            method: "eth_getBlockByNumber",
        };
        assert_eq!(
            timeout.to_string(),
            "rpc method eth_getBlockByNumber timed out"
        );

        let missing = RpcError::BlockNotFound { height: 42 };
        assert_eq!(missing.to_string(), "node returned no block at height 42");
    }

    #[test]
    fn errors_survive_anyhow_round_trips() {
        let err: anyhow::Error = RpcError::BlockNotFound { height: 7 }.into();
        match err.downcast_ref::<RpcError>() {
            Some(RpcError::BlockNotFound { height }) => assert_eq!(*height, 7),
            other => panic!("expected BlockNotFound, got {other:?}"),
        }
    }

    #[test]
    fn client_rejects_invalid_options() {
        let options = RpcClientOptions {
            request_timeout: std::time::Duration::ZERO,
            ..RpcClientOptions::default()
        };
        assert!(EthRpcClient::with_options("http://localhost:8545", options).is_err());
    }
}
