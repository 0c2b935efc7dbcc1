//! Supervisor: wires the coordination plane, fetch plane, and store
//! together, spawns N workers plus the seeder, janitor, and metrics
//! reporter, and handles OS signals for graceful shutdowns.
//!
//! A worker error or panic captures the cause, cancels the root token, and
//! brings the whole process down; leases make that safe, since anything in
//! flight is recovered by the next janitor pass.

use crate::coord::limiter::RateLimiter;
use crate::coord::queue::WorkQueue;
use crate::coord::store::CoordStore;
use crate::fetch::fetcher::BlockFetcher;
use crate::rpc::client::BlockRpc;
use crate::runtime::config::{IndexerConfig, RATE_LIMIT_WINDOW};
use crate::runtime::janitor::Janitor;
use crate::runtime::seeder::Seeder;
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry};
use crate::runtime::worker::{Worker, WorkerParams};
use crate::store::BlockWriter;
use anyhow::Result;
use futures::FutureExt;
use std::any::Any;
use std::sync::{Arc, Mutex};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Supervisor {
    config: IndexerConfig,
    coord: Arc<dyn CoordStore>,
    writer: Arc<dyn BlockWriter>,
    rpc: Arc<dyn BlockRpc>,
    shutdown: CancellationToken,
    telemetry: Arc<Telemetry>,
}

/// Handles to a running deployment. Cancel with [`Self::shutdown`], then
/// [`Self::join`] to collect the outcome.
pub struct SupervisorHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    fatal: Arc<Mutex<Option<anyhow::Error>>>,
}

impl SupervisorHandle {
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Await every spawned task and surface the first fatal error, if any.
    pub async fn join(self) -> Result<()> {
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "supervised task terminated unexpectedly");
            }
        }

        let captured = self.fatal.lock().expect("fatal slot poisoned").take();
        match captured {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Supervisor {
    pub fn new(
        config: IndexerConfig,
        coord: Arc<dyn CoordStore>,
        writer: Arc<dyn BlockWriter>,
        rpc: Arc<dyn BlockRpc>,
    ) -> Self {
        Self {
            config,
            coord,
            writer,
            rpc,
            shutdown: CancellationToken::new(),
            telemetry: Arc::new(Telemetry::default()),
        }
    }

    /// Root token, for callers integrating their own shutdown strategy.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Spawn every component of the deployment and return their handles.
    pub fn start(&self) -> SupervisorHandle {
        let queue = Arc::new(WorkQueue::new(
            self.coord.clone(),
            self.config.batch_size(),
            self.config.min_block(),
            self.config.lease_ttl(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            self.coord.clone(),
            self.config.rpc_rate_limit(),
            RATE_LIMIT_WINDOW,
            self.telemetry.clone(),
        ));
        let fetcher = Arc::new(BlockFetcher::new(
            self.rpc.clone(),
            limiter,
            self.telemetry.clone(),
            self.config.max_retries(),
            self.config.fetch_backoff_base(),
        ));

        let fatal: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));
        let mut tasks = Vec::with_capacity(self.config.worker_count() + 3);

        tracing::info!(
            workers = self.config.worker_count(),
            batch_size = self.config.batch_size(),
            rate_limit = self.config.rpc_rate_limit(),
            "starting indexer supervisor"
        );

        for worker_id in 0..self.config.worker_count() {
            let worker = Worker::new(WorkerParams {
                id: worker_id,
                queue: queue.clone(),
                fetcher: fetcher.clone(),
                writer: self.writer.clone(),
                telemetry: self.telemetry.clone(),
                shutdown: self.shutdown.clone(),
                max_concurrent_blocks: self.config.max_concurrent_blocks(),
                heartbeat_interval: self.config.heartbeat_interval(),
                take_poll_interval: self.config.take_poll_interval(),
                failure_pause: self.config.failure_pause(),
            });

            let fatal = fatal.clone();
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let result = std::panic::AssertUnwindSafe(worker.run())
                    .catch_unwind()
                    .await;

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(worker = worker_id, error = %err, "worker exited with error");
                        capture_fatal(&fatal, err.context(format!("worker {worker_id} failed")));
                        shutdown.cancel();
                    }
                    Err(panic_payload) => {
                        let message = panic_message(panic_payload.as_ref());
                        tracing::error!(worker = worker_id, panic = %message, "worker panicked");
                        capture_fatal(
                            &fatal,
                            anyhow::anyhow!("worker {worker_id} panicked: {message}"),
                        );
                        shutdown.cancel();
                    }
                }
            }));
        }

        let seeder = Seeder::new(
            self.rpc.clone(),
            queue.clone(),
            self.config.seed_interval(),
            self.shutdown.clone(),
        );
        tasks.push(tokio::spawn(seeder.run()));

        let janitor = Janitor::new(
            queue.clone(),
            self.telemetry.clone(),
            self.config.janitor_interval(),
            self.shutdown.clone(),
        );
        tasks.push(tokio::spawn(janitor.run()));

        tasks.push(spawn_metrics_reporter(
            self.telemetry.clone(),
            queue,
            self.shutdown.clone(),
            self.config.metrics_interval(),
        ));

        SupervisorHandle {
            shutdown: self.shutdown.clone(),
            tasks,
            fatal,
        }
    }

    /// Run until SIGINT/SIGTERM arrives or the root token is cancelled
    /// (including by a fatal worker error), then shut down gracefully.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let handle = self.start();
        wait_for_shutdown_signal(&self.shutdown).await;

        handle.shutdown();
        handle.join().await
    }
}

async fn wait_for_shutdown_signal(shutdown: &CancellationToken) {
    #[cfg(unix)]
    {
        let mut sigterm =
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::error!(error = %err, "failed to install SIGTERM handler");
                    shutdown.cancelled().await;
                    return;
                }
            };

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("SIGINT received; shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received; shutting down");
            }
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown token cancelled");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down");
            }
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown token cancelled");
            }
        }
    }
}

fn capture_fatal(slot: &Mutex<Option<anyhow::Error>>, err: anyhow::Error) {
    let mut guard = slot.lock().expect("fatal slot poisoned");
    if guard.is_none() {
        *guard = Some(err);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
