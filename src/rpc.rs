//! JSON-RPC client plumbing for the upstream EVM node: typed wire structs,
//! hex-quantity helpers, client options, and the client itself.

pub mod client;
pub mod helpers;
pub mod options;
pub mod types;

pub use client::{BlockRpc, EthRpcClient, RpcError};
pub use helpers::{height_to_hex, hex_to_decimal, hex_to_u64};
pub use options::RpcClientOptions;
pub use types::{RpcBlock, RpcLog, RpcReceipt, RpcTransaction};
