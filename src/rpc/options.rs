//! Configurable knobs for the JSON-RPC client with validation so callers
//! can reason about timeouts and payload limits up front.

use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;
const DEFAULT_MAX_REQUEST_BODY_BYTES: u32 = 1024 * 1024;
const DEFAULT_MAX_RESPONSE_BODY_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RpcClientOptions {
    /// Hard per-call deadline. Must stay strictly below the lease TTL minus
    /// the heartbeat interval so a slow call can never outlive its lease.
    pub request_timeout: Duration,
    pub max_request_body_bytes: u32,
    pub max_response_body_bytes: u32,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_request_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
        }
    }
}

impl RpcClientOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }
        if self.max_request_body_bytes == 0 {
            bail!("max_request_body_bytes must be greater than 0");
        }
        if self.max_response_body_bytes == 0 {
            bail!("max_response_body_bytes must be greater than 0");
        }
        Ok(())
    }
}
