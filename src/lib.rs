pub mod coord;
pub mod fetch;
pub mod rpc;
pub mod runtime;
pub mod store;

pub use coord::limiter::{RateLimiter, RATE_LIMIT_KEY};
pub use coord::memory::MemoryCoord;
pub use coord::queue::{BlockRange, QueueDepth, WorkQueue};
pub use coord::redis::RedisCoord;
pub use coord::store::{CoordOp, CoordStore, TakeHandle};
pub use fetch::fetcher::BlockFetcher;
pub use fetch::records::{assemble, BlockRecord, FetchedBlock, LogRecord, TxRecord};
pub use rpc::client::{BlockRpc, EthRpcClient, RpcError};
pub use rpc::options::RpcClientOptions;
pub use runtime::config::{IndexerConfig, IndexerConfigBuilder, RATE_LIMIT_WINDOW};
pub use runtime::janitor::Janitor;
pub use runtime::seeder::Seeder;
pub use runtime::supervisor::{Supervisor, SupervisorHandle};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use runtime::worker::{Worker, WorkerParams};
pub use store::error::StoreError;
pub use store::memory::MemoryBlockStore;
pub use store::postgres::PgBlockStore;
pub use store::BlockWriter;
