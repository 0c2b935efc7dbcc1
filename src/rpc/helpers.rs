//! Utility helpers for the hex-encoded quantities the Ethereum JSON-RPC
//! interface speaks: `0x`-prefixed heights, u64 quantities, and 256-bit
//! values carried onward as decimal strings.

use alloy_primitives::U256;
use anyhow::{Context, Result};

/// Encodes a block height as the `0x`-prefixed hex quantity the RPC expects.
pub fn height_to_hex(height: u64) -> String {
    format!("{height:#x}")
}

/// Decodes a `0x`-prefixed hex quantity into a `u64`.
pub fn hex_to_u64(raw: &str) -> Result<u64> {
    let digits = raw
        .trim()
        .strip_prefix("0x")
        .with_context(|| format!("quantity {raw:?} is missing the 0x prefix"))?;
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid hex quantity {raw:?}"))
}

/// Decodes a `0x`-prefixed hex quantity of up to 256 bits into its decimal
/// string form. Full precision is preserved; the relational store holds
/// these as `numeric(78,0)`.
pub fn hex_to_decimal(raw: &str) -> Result<String> {
    let digits = raw
        .trim()
        .strip_prefix("0x")
        .with_context(|| format!("quantity {raw:?} is missing the 0x prefix"))?;
    let value = U256::from_str_radix(digits, 16)
        .with_context(|| format!("invalid 256-bit hex quantity {raw:?}"))?;
    Ok(value.to_string())
}
