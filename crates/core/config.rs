//! Configuration types for workers and worker pools.

use std::time::Duration;

use crate::error::{LockqError, Result};

/// Configuration for a single [`Worker`](crate::Worker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Queue to claim jobs from.
    pub queue: String,
    /// How long to sleep when a poll finds nothing to do.
    pub poll_interval: Duration,
    /// Worker id used in log records; generated when unset.
    pub id: Option<String>,
    /// Execute every job type, not only the registered ones.
    pub all_jobs: bool,
    /// Skip jobs that have failed this many times. 0 means no limit.
    pub max_error_count: i32,
    /// When > 0, claim only jobs that have failed at least this many times.
    pub min_error_count: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            poll_interval: Duration::from_secs(5),
            id: None,
            all_jobs: false,
            max_error_count: 0,
            min_error_count: 0,
        }
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(LockqError::Config(
                "poll_interval must be greater than 0".to_string(),
            ));
        }
        if self.max_error_count < 0 || self.min_error_count < 0 {
            return Err(LockqError::Config(
                "error count thresholds must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.config.queue = queue.into();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = Some(id.into());
        self
    }

    pub fn all_jobs(mut self, all: bool) -> Self {
        self.config.all_jobs = all;
        self
    }

    pub fn max_error_count(mut self, count: i32) -> Self {
        self.config.max_error_count = count;
        self
    }

    pub fn min_error_count(mut self, count: i32) -> Self {
        self.config.min_error_count = count;
        self
    }

    /// Build and validate the WorkerConfig.
    pub fn build(self) -> Result<WorkerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration for a [`WorkerPool`](crate::WorkerPool).
///
/// Every member worker gets the same settings; worker ids are derived from
/// the pool id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of workers to run.
    pub num_workers: usize,
    /// Pool id used in log records; generated when unset.
    pub id: Option<String>,
    /// Settings shared by all workers (`worker.id` is ignored).
    pub worker: WorkerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            id: None,
            worker: WorkerConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create a new builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(LockqError::Config(
                "workers must be greater than 0".to_string(),
            ));
        }
        self.worker.validate()
    }

    /// Configuration for the worker at `index` in pool `pool_id`.
    pub(crate) fn member(&self, pool_id: &str, index: usize) -> WorkerConfig {
        WorkerConfig {
            id: Some(format!("{pool_id}/{index}")),
            ..self.worker.clone()
        }
    }
}

/// Builder for PoolConfig.
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    pub fn num_workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = Some(id.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.config.worker.queue = queue.into();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.worker.poll_interval = interval;
        self
    }

    pub fn all_jobs(mut self, all: bool) -> Self {
        self.config.worker.all_jobs = all;
        self
    }

    pub fn max_error_count(mut self, count: i32) -> Self {
        self.config.worker.max_error_count = count;
        self
    }

    pub fn min_error_count(mut self, count: i32) -> Self {
        self.config.worker.min_error_count = count;
        self
    }

    /// Build and validate the PoolConfig.
    pub fn build(self) -> Result<PoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
