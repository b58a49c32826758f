//! Job definition and settlement.
//!
//! A [`NewJob`] is what producers enqueue. A [`Job`] is a claimed row: it
//! owns the transaction holding the row lock until it is settled with
//! [`Job::done`] or [`Job::error`], or abandoned with [`Job::release`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::backoff::DynBackoff;
use crate::error::{rollback_result, LockqError, Result};
use crate::store::{FailureUpdate, Tx};

/// Store-assigned identifier of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job to be enqueued.
///
/// `run_at` and `args` are optional: an unset `run_at` means "now" and empty
/// `args` are stored as `[]`. After a successful enqueue `id`, `run_at` and
/// `args` hold the values that were written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewJob {
    pub id: Option<JobId>,
    pub queue: String,
    pub priority: i16,
    pub run_at: Option<DateTime<Utc>>,
    pub job_type: String,
    pub args: Vec<u8>,
}

impl NewJob {
    /// Create a job of the given type on the default queue.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    /// Set the queue name.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the priority. Lower values are claimed first.
    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    /// Make the job eligible no earlier than `run_at`.
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Make the job eligible after `delay`.
    pub fn run_in(self, delay: Duration) -> Self {
        self.run_at(add_delay(Utc::now(), delay))
    }

    /// Set the raw argument payload.
    pub fn args(mut self, args: impl Into<Vec<u8>>) -> Self {
        self.args = args.into();
        self
    }

    /// Encode `args` as JSON and use it as the payload.
    pub fn json_args<T: Serialize>(mut self, args: &T) -> Result<Self> {
        self.args = serde_json::to_vec(args)?;
        Ok(self)
    }
}

/// One stored job row.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: JobId,
    pub queue: String,
    pub priority: i16,
    pub run_at: DateTime<Utc>,
    pub job_type: String,
    pub args: Vec<u8>,
    pub error_count: i32,
    pub last_error: Option<String>,
}

impl JobRow {
    /// Decode the argument payload as JSON.
    pub fn args_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.args)?)
    }
}

/// A claimed job, bound to the transaction that holds its row lock.
///
/// Exactly one of [`done`](Job::done), [`error`](Job::error) or
/// [`release`](Job::release) should be called. A second settle returns
/// [`LockqError::Settled`]. Dropping an unsettled job drops its transaction,
/// which rolls it back.
pub struct Job {
    row: JobRow,
    tx: Option<Box<dyn Tx>>,
    backoff: DynBackoff,
}

impl Job {
    pub(crate) fn new(row: JobRow, tx: Box<dyn Tx>, backoff: DynBackoff) -> Self {
        Self {
            row,
            tx: Some(tx),
            backoff,
        }
    }

    pub fn id(&self) -> JobId {
        self.row.id
    }

    pub fn job_type(&self) -> &str {
        &self.row.job_type
    }

    pub fn error_count(&self) -> i32 {
        self.row.error_count
    }

    /// The row as it was when claimed, updated after a successful `error`.
    pub fn row(&self) -> &JobRow {
        &self.row
    }

    /// Whether the job still holds its transaction.
    pub fn is_claimed(&self) -> bool {
        self.tx.is_some()
    }

    /// Delete the job and commit, releasing the lock for good.
    pub async fn done(&mut self) -> Result<()> {
        let id = self.row.id;
        let mut tx = self.tx.take().ok_or(LockqError::Settled(id))?;

        if let Err(e) = tx.delete_job(id).await {
            let rb = tx.rollback().await;
            return Err(settle_error("delete", id, rollback_result(&rb), e));
        }

        tx.commit()
            .await
            .map_err(|e| settle_error("commit", id, COMMIT_NO_ROLLBACK.to_string(), e))?;

        tracing::debug!(job_id = %id, "Job done");
        Ok(())
    }

    /// Record a failure and reschedule the job according to the backoff.
    pub async fn error(&mut self, message: &str) -> Result<()> {
        let id = self.row.id;
        let mut tx = self.tx.take().ok_or(LockqError::Settled(id))?;

        let now = Utc::now();
        let error_count = self.row.error_count + 1;
        let update = FailureUpdate {
            error_count,
            last_error: message.to_string(),
            run_at: add_delay(now, self.backoff.delay(error_count)),
            updated_at: now,
        };

        if let Err(e) = tx.record_failure(id, &update).await {
            let rb = tx.rollback().await;
            return Err(settle_error("update", id, rollback_result(&rb), e));
        }

        tx.commit()
            .await
            .map_err(|e| settle_error("commit", id, COMMIT_NO_ROLLBACK.to_string(), e))?;

        tracing::debug!(
            job_id = %id,
            error_count = error_count,
            run_at = %update.run_at,
            "Job rescheduled after error"
        );

        self.row.error_count = error_count;
        self.row.last_error = Some(update.last_error);
        self.row.run_at = update.run_at;
        Ok(())
    }

    /// Roll back without recording anything; the row stays as it was.
    pub async fn release(&mut self) -> Result<()> {
        let id = self.row.id;
        let tx = self.tx.take().ok_or(LockqError::Settled(id))?;
        tx.rollback().await
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("row", &self.row)
            .field("claimed", &self.tx.is_some())
            .finish()
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::warn!(job_id = %self.row.id, "Job dropped while claimed, rolling back");
        }
    }
}

// A failed commit consumes the transaction; the store rolls it back.
const COMMIT_NO_ROLLBACK: &str = "not attempted (transaction consumed by commit)";

fn settle_error(
    action: &'static str,
    job_id: JobId,
    rollback: String,
    source: LockqError,
) -> LockqError {
    LockqError::Settle {
        action,
        job_id,
        rollback,
        source: Box::new(source),
    }
}

/// `now + delay`, saturating at the largest representable instant.
pub(crate) fn add_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
