//! Store abstraction for job queue persistence.
//!
//! The queue needs very little from a store: a way to open a transaction,
//! insert a row, and lock one matching row while skipping rows that are
//! already locked by another transaction. Everything else (mutual exclusion
//! between workers, visibility of retries) follows from transaction
//! semantics.
//!
//! [`ConnPool`] is the connection pool side, [`Tx`] is one open transaction.
//! A `Tx` that is dropped without `commit` or `rollback` must release its
//! locks, the same way a database does when the session holding them ends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::Result;
use crate::job::{JobId, JobRow};

/// Row data written by an enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJobRow {
    pub queue: String,
    pub priority: i16,
    pub run_at: DateTime<Utc>,
    pub job_type: String,
    pub args: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Which rows a claim may select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockQuery {
    /// Regular claim: `run_at <= now AND queue = queue`, plus
    /// `error_count < max_error_count` when `max_error_count > 0`.
    Eligible {
        queue: String,
        now: DateTime<Utc>,
        max_error_count: i32,
    },
    /// Error sweep: `error_count >= min_error_count`, optionally limited to
    /// one queue. `run_at` is not consulted.
    MinError {
        queue: Option<String>,
        min_error_count: i32,
    },
}

impl LockQuery {
    /// Whether `row` satisfies this query's filter (locks aside).
    pub fn matches(&self, row: &JobRow) -> bool {
        match self {
            LockQuery::Eligible {
                queue,
                now,
                max_error_count,
            } => {
                row.run_at <= *now
                    && row.queue == *queue
                    && (*max_error_count <= 0 || row.error_count < *max_error_count)
            }
            LockQuery::MinError {
                queue,
                min_error_count,
            } => {
                row.error_count >= *min_error_count
                    && queue.as_deref().map_or(true, |q| row.queue == q)
            }
        }
    }
}

/// Columns rewritten when a claimed job fails.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureUpdate {
    pub error_count: i32,
    pub last_error: String,
    pub run_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Connection pool capability.
#[async_trait]
pub trait ConnPool: Send + Sync {
    /// Open a new transaction.
    async fn begin(&self) -> Result<Box<dyn Tx>>;

    /// Insert a job outside any caller transaction and return its id.
    async fn insert_job(&self, job: &NewJobRow) -> Result<JobId>;
}

/// One open transaction.
#[async_trait]
pub trait Tx: Send {
    /// Insert a job inside this transaction and return its id.
    async fn insert_job(&mut self, job: &NewJobRow) -> Result<JobId>;

    /// Select the lowest-priority-value row matching `query` and lock it for
    /// the rest of this transaction, skipping rows locked elsewhere.
    ///
    /// Returns `Ok(None)` when nothing matches.
    async fn lock_job(&mut self, query: &LockQuery) -> Result<Option<JobRow>>;

    /// Delete a job row.
    async fn delete_job(&mut self, id: JobId) -> Result<()>;

    /// Record a failed execution on a job row.
    async fn record_failure(&mut self, id: JobId, update: &FailureUpdate) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A type-erased pool that can be shared across threads.
pub type DynPool = Arc<dyn ConnPool>;

/// Wrapper around `Arc<dyn ConnPool>` for convenience.
#[derive(Clone)]
pub struct SharedPool {
    inner: DynPool,
}

impl SharedPool {
    /// Create a new SharedPool from any ConnPool implementation.
    pub fn new<P: ConnPool + 'static>(pool: P) -> Self {
        Self {
            inner: Arc::new(pool),
        }
    }

    /// Get a reference to the inner pool.
    pub fn inner(&self) -> &DynPool {
        &self.inner
    }
}

impl From<DynPool> for SharedPool {
    fn from(inner: DynPool) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ConnPool for SharedPool {
    async fn begin(&self) -> Result<Box<dyn Tx>> {
        self.inner.begin().await
    }

    async fn insert_job(&self, job: &NewJobRow) -> Result<JobId> {
        self.inner.insert_job(job).await
    }
}
