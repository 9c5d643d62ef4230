//! Poll-based outbox workers with supervised lifecycle.
//!
//! Workers repeatedly claim a batch of eligible entries and process each
//! one. Any number of workers may run against the same store; the
//! skip-locked claim keeps their batches disjoint. The pool provides
//! structured spawning, shared statistics, and graceful shutdown.

use std::{sync::Arc, time::Duration};

use herald_core::error::Result;
use tokio::{sync::RwLock, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::OutboxRegistry;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,

    /// Batch size per claim; `None` uses the registry's configured size.
    pub batch_size: Option<usize>,

    /// How long to wait before polling again when no work was available.
    pub poll_interval: Duration,

    /// Backoff after a storage error to avoid tight failure loops.
    pub error_backoff: Duration,

    /// Maximum time to wait for in-flight work during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: None,
            poll_interval: Duration::from_secs(crate::DEFAULT_POLL_INTERVAL_SECONDS),
            error_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared statistics for monitoring the pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Workers currently running.
    pub active_workers: usize,

    /// Batches that contained at least one entry.
    pub batches_claimed: u64,

    /// Entries that finished as processed.
    pub entries_processed: u64,

    /// Entries that finished unprocessed (failed, stale, or deferred).
    pub entries_unprocessed: u64,
}

/// Single worker driving the claim/process contract.
pub struct OutboxWorker {
    id: usize,
    registry: Arc<OutboxRegistry>,
    config: WorkerConfig,
    stats: Arc<RwLock<WorkerStats>>,
    cancellation_token: CancellationToken,
}

impl OutboxWorker {
    /// Creates a worker with the given identity and shared state.
    pub fn new(
        id: usize,
        registry: Arc<OutboxRegistry>,
        config: WorkerConfig,
        stats: Arc<RwLock<WorkerStats>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, registry, config, stats, cancellation_token }
    }

    /// Main loop: claim and process entries until cancelled.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "outbox worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "outbox worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = sleep(self.config.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(batch_error) => {
                    error!(
                        worker_id = self.id,
                        error = %batch_error,
                        "worker batch processing failed"
                    );
                    tokio::select! {
                        () = sleep(self.config.error_backoff) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "outbox worker stopped");
        Ok(())
    }

    /// Claims one batch and processes every claimed entry.
    ///
    /// Returns how many entries were claimed.
    async fn process_batch(&self) -> Result<usize> {
        let claimed = self.registry.claim_outbox_batch(self.config.batch_size).await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        debug!(worker_id = self.id, batch_size = claimed.len(), "processing outbox batch");
        {
            let mut stats = self.stats.write().await;
            stats.batches_claimed += 1;
        }

        let batch_size = claimed.len();
        for outbox_id in claimed {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.registry.process_outbox_entry(outbox_id).await {
                Ok(processed) => {
                    let mut stats = self.stats.write().await;
                    if processed {
                        stats.entries_processed += 1;
                    } else {
                        stats.entries_unprocessed += 1;
                    }
                },
                Err(entry_error) => {
                    error!(
                        worker_id = self.id,
                        outbox_id,
                        error = %entry_error,
                        "outbox entry processing failed"
                    );
                    let mut stats = self.stats.write().await;
                    stats.entries_unprocessed += 1;
                },
            }
        }

        Ok(batch_size)
    }
}

/// Pool of supervised outbox workers.
pub struct WorkerPool {
    registry: Arc<OutboxRegistry>,
    config: WorkerConfig,
    stats: Arc<RwLock<WorkerStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Creates a pool over the given registry.
    pub fn new(registry: Arc<OutboxRegistry>, config: WorkerConfig) -> Self {
        Self {
            registry,
            config,
            stats: Arc::new(RwLock::new(WorkerStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
        }
    }

    /// Spawns all configured workers and returns immediately.
    pub async fn spawn_workers(&mut self) {
        info!(worker_count = self.config.worker_count, "spawning outbox workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = self.config.worker_count;
        }

        for worker_id in 0..self.config.worker_count {
            let worker = OutboxWorker::new(
                worker_id,
                self.registry.clone(),
                self.config.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref worker_error) = result {
                    error!(worker_id, error = %worker_error, "outbox worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }
    }

    /// Returns a snapshot of the pool statistics.
    pub async fn stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    /// True while any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|handle| !handle.is_finished())
    }

    /// Signals all workers to stop and waits for them within the timeout.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the shutdown timeout elapses with
    /// workers still running.
    pub async fn shutdown_graceful(mut self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let shutdown = async move {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(worker_error)) => {
                        warn!(
                            worker_id,
                            error = %worker_error,
                            "worker completed with error during shutdown"
                        );
                    },
                    Err(join_error) => {
                        error!(
                            worker_id,
                            error = %join_error,
                            "worker task panicked during shutdown"
                        );
                    },
                }
            }

            let mut stats = stats.write().await;
            stats.active_workers = 0;
        };

        match tokio::time::timeout(timeout, shutdown).await {
            Ok(()) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(herald_core::RegistryError::Configuration(format!(
                    "worker shutdown timed out after {}s",
                    timeout.as_secs()
                )))
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|handle| !handle.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active,
                "worker pool dropped with active workers, forcing cancellation"
            );
            self.cancellation_token.cancel();
        }
    }
}
