//! Client for enqueueing and claiming jobs.

use chrono::Utc;
use std::sync::Arc;

use crate::backoff::{DynBackoff, Exponential};
use crate::error::{rollback_result, LockqError, Result};
use crate::ident::new_id;
use crate::job::{Job, JobId, NewJob};
use crate::store::{ConnPool, LockQuery, NewJobRow, SharedPool, Tx};

/// Client that adds jobs to the queue and claims them back out.
///
/// The client holds no state besides the pool handle, so it is cheap to
/// clone and share between workers.
#[derive(Clone)]
pub struct Client {
    pool: SharedPool,
    id: String,
    backoff: DynBackoff,
}

impl Client {
    /// Create a new client over any pool implementation.
    pub fn new(pool: impl ConnPool + 'static) -> Self {
        Self::with_pool(SharedPool::new(pool))
    }

    /// Create a new client over an already shared pool.
    pub fn with_pool(pool: SharedPool) -> Self {
        Self {
            pool,
            id: new_id(),
            backoff: Arc::new(Exponential::default()),
        }
    }

    /// Set the client id used in log records.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !id.is_empty() {
            self.id = id;
        }
        self
    }

    /// Set the strategy used to reschedule failed jobs.
    pub fn with_backoff(mut self, backoff: DynBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a job to the queue.
    ///
    /// On success `job.id` holds the generated id, and `job.run_at` and
    /// `job.args` hold the values actually stored.
    pub async fn enqueue(&self, job: &mut NewJob) -> Result<JobId> {
        let row = prepare(job)?;
        let result = self.pool.insert_job(&row).await;
        self.finish_enqueue(job, result)
    }

    /// Add a job to the queue inside a caller-managed transaction.
    ///
    /// The job commits or rolls back together with whatever else the caller
    /// does in `tx`. Committing or rolling back is the caller's job.
    pub async fn enqueue_tx(&self, job: &mut NewJob, tx: &mut dyn Tx) -> Result<JobId> {
        let row = prepare(job)?;
        let result = tx.insert_job(&row).await;
        self.finish_enqueue(job, result)
    }

    fn finish_enqueue(&self, job: &mut NewJob, result: Result<JobId>) -> Result<JobId> {
        match &result {
            Ok(id) => {
                job.id = Some(*id);
                tracing::debug!(
                    client_id = %self.id,
                    queue = %job.queue,
                    job_id = %id,
                    job_type = %job.job_type,
                    "Job enqueued"
                );
            }
            Err(e) => {
                tracing::debug!(
                    client_id = %self.id,
                    queue = %job.queue,
                    error = %e,
                    "Failed to enqueue job"
                );
            }
        }
        result
    }

    /// Claim the next eligible job in `queue`.
    ///
    /// Eligible means `run_at <= now` and, when `max_error_count > 0`,
    /// `error_count < max_error_count`. Among eligible rows the lowest
    /// priority value wins; rows locked by other claimants are skipped.
    ///
    /// The returned job holds its transaction (and row lock) until it is
    /// settled. `Ok(None)` means nothing is eligible right now.
    pub async fn lock_job(&self, queue: &str, max_error_count: i32) -> Result<Option<Job>> {
        self.lock_with(LockQuery::Eligible {
            queue: queue.to_string(),
            now: Utc::now(),
            max_error_count,
        })
        .await
    }

    /// Claim a job that has failed at least `min_error_count` times.
    ///
    /// An empty `queue` searches all queues. This mode ignores `run_at`; it
    /// is meant for triaging chronically failing work, not for the regular
    /// retry path.
    pub async fn lock_job_min_error(
        &self,
        queue: &str,
        min_error_count: i32,
    ) -> Result<Option<Job>> {
        self.lock_with(LockQuery::MinError {
            queue: (!queue.is_empty()).then(|| queue.to_string()),
            min_error_count,
        })
        .await
    }

    async fn lock_with(&self, query: LockQuery) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        match tx.lock_job(&query).await {
            Ok(Some(row)) => {
                tracing::debug!(
                    client_id = %self.id,
                    job_id = %row.id,
                    job_type = %row.job_type,
                    queue = %row.queue,
                    "Job locked"
                );
                Ok(Some(Job::new(row, tx, Arc::clone(&self.backoff))))
            }
            Ok(None) => {
                tx.rollback().await?;
                Ok(None)
            }
            Err(e) => {
                let rb = tx.rollback().await;
                Err(LockqError::LockJob {
                    rollback: rollback_result(&rb),
                    source: Box::new(e),
                })
            }
        }
    }
}

/// Validate a job and fill in its defaults.
fn prepare(job: &mut NewJob) -> Result<NewJobRow> {
    if job.job_type.is_empty() {
        return Err(LockqError::MissingType);
    }

    let now = Utc::now();
    let run_at = *job.run_at.get_or_insert(now);
    if job.args.is_empty() {
        job.args = b"[]".to_vec();
    }

    Ok(NewJobRow {
        queue: job.queue.clone(),
        priority: job.priority,
        run_at,
        job_type: job.job_type.clone(),
        args: job.args.clone(),
        created_at: now,
    })
}
