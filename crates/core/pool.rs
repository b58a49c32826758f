//! Worker pool for processing jobs.

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::client::Client;
use crate::config::PoolConfig;
use crate::error::{LockqError, Result};
use crate::handler::WorkMap;
use crate::ident::new_id;
use crate::shutdown::Shutdown;
use crate::worker::Worker;

/// A fixed-size group of workers sharing one client, work map and
/// configuration.
pub struct WorkerPool {
    id: String,
    client: Client,
    work_map: Arc<WorkMap>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(client: Client, work_map: impl Into<Arc<WorkMap>>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let id = config.id.clone().unwrap_or_else(new_id);

        Ok(Self {
            id,
            client,
            work_map: work_map.into(),
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn every worker and return a handle to stop them.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Result<WorkerPoolHandle> {
        let shutdown = Shutdown::new();
        let mut tasks = JoinSet::new();

        for index in 0..self.config.num_workers {
            let worker = Worker::new(
                self.client.clone(),
                Arc::clone(&self.work_map),
                self.config.member(&self.id, index),
            )?;
            let shutdown = shutdown.clone();
            tasks.spawn(async move { worker.run(shutdown).await });
        }

        tracing::info!(
            pool_id = %self.id,
            workers = self.config.num_workers,
            queue = %self.config.worker.queue,
            job_types = ?self.work_map.job_types(),
            "Worker pool started"
        );

        Ok(WorkerPoolHandle {
            id: self.id,
            shutdown,
            tasks,
        })
    }

    /// Run the pool until `signal` completes, then shut it down gracefully.
    ///
    /// Also returns once every worker has stopped on its own, e.g. after
    /// losing the store connection, with the first worker error.
    pub async fn run_until<S>(self, signal: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        self.start()?.wait_until(signal).await
    }

    /// Run the pool until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }
}

/// Handle to a started [`WorkerPool`].
pub struct WorkerPoolHandle {
    id: String,
    shutdown: Shutdown,
    tasks: JoinSet<Result<()>>,
}

impl WorkerPoolHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The signal shared by all workers of this pool.
    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Number of workers still running.
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Ask every worker to stop and wait until all of them have.
    ///
    /// Jobs already claimed are executed and settled first.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.trigger();
        self.wait().await
    }

    /// Wait for every worker to stop without asking them to.
    ///
    /// Returns the first worker error, if any.
    pub async fn wait(self) -> Result<()> {
        self.wait_until(std::future::pending()).await
    }

    /// Wait for every worker to stop, asking them to once `signal` completes.
    ///
    /// Returns the first worker error, if any.
    pub async fn wait_until<S>(mut self, signal: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(signal);
        let mut signalled = false;
        let mut first_error = None;

        loop {
            let joined = tokio::select! {
                _ = &mut signal, if !signalled => {
                    tracing::info!(pool_id = %self.id, "Shutdown requested, draining...");
                    self.shutdown.trigger();
                    signalled = true;
                    continue;
                }
                joined = self.tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => {
                    tracing::error!(pool_id = %self.id, error = %e, "Worker task panicked");
                    LockqError::WorkerPanicked(e.to_string())
                }
            };
            tracing::error!(pool_id = %self.id, error = %err, "Worker exited with error");
            first_error.get_or_insert(err);
        }

        tracing::info!(pool_id = %self.id, "Worker pool stopped");
        first_error.map_or(Ok(()), Err)
    }
}
