use anyhow::{Context, Result};
use blocksink::rpc::options::RpcClientOptions;
use blocksink::{init_tracing, EthRpcClient, IndexerConfig, PgBlockStore, RedisCoord, Supervisor};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = IndexerConfig::from_env().context("failed to load configuration")?;

    let coord = Arc::new(
        RedisCoord::connect(config.redis_url())
            .await
            .context("failed to connect to the coordination store")?,
    );
    let writer = Arc::new(
        PgBlockStore::connect(config.database_url(), config.store_max_connections())
            .await
            .map_err(|err| anyhow::anyhow!("{err}"))
            .context("failed to connect to the block store")?,
    );
    let rpc = Arc::new(
        EthRpcClient::with_options(
            config.rpc_url(),
            RpcClientOptions {
                request_timeout: config.rpc_timeout(),
                ..RpcClientOptions::default()
            },
        )
        .context("failed to build the RPC client")?,
    );

    let supervisor = Supervisor::new(config, coord, writer, rpc);
    supervisor.run_until_shutdown().await
}
