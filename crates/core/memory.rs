//! In-memory store for tests and single-process use.
//!
//! Emulates the parts of a relational store the queue relies on:
//! exclusive row locks owned by a transaction, skip-locked selection, and
//! writes that only become visible when their transaction commits.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::error::{LockqError, Result};
use crate::job::{JobId, JobRow};
use crate::store::{ConnPool, FailureUpdate, LockQuery, NewJobRow, Tx};

#[derive(Default)]
struct State {
    rows: BTreeMap<JobId, JobRow>,
    // job id -> owning transaction id
    locks: HashMap<JobId, u64>,
    next_job_id: i64,
    next_tx_id: u64,
    fail_write: Option<String>,
    fail_lock: Option<String>,
    fail_commit: Option<String>,
    disconnected: bool,
}

impl State {
    fn check_connected(&self) -> Result<()> {
        if self.disconnected {
            return Err(LockqError::ConnectionLost("memory pool disconnected".to_string()));
        }
        Ok(())
    }

    fn check_write(&mut self) -> Result<()> {
        self.check_connected()?;
        match self.fail_write.take() {
            Some(msg) => Err(LockqError::Backend(msg)),
            None => Ok(()),
        }
    }

    fn allocate_id(&mut self) -> JobId {
        self.next_job_id += 1;
        JobId(self.next_job_id)
    }

    fn release_locks(&mut self, tx_id: u64) {
        self.locks.retain(|_, owner| *owner != tx_id);
    }
}

fn row_from(id: JobId, job: &NewJobRow) -> JobRow {
    JobRow {
        id,
        queue: job.queue.clone(),
        priority: job.priority,
        run_at: job.run_at,
        job_type: job.job_type.clone(),
        args: job.args.clone(),
        error_count: 0,
        last_error: None,
    }
}

/// In-memory job store.
///
/// Cloning creates a new handle to the **same** underlying table.
#[derive(Clone, Default)]
pub struct MemoryPool {
    state: Arc<Mutex<State>>,
}

impl MemoryPool {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock_state(&self.state)
    }

    /// Number of committed rows.
    pub fn len(&self) -> usize {
        self.state().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Committed row by id.
    pub fn get(&self, id: JobId) -> Option<JobRow> {
        self.state().rows.get(&id).cloned()
    }

    /// All committed rows in id order.
    pub fn rows(&self) -> Vec<JobRow> {
        self.state().rows.values().cloned().collect()
    }

    /// Number of rows currently locked by open transactions.
    pub fn locked_count(&self) -> usize {
        self.state().locks.len()
    }

    /// Overwrite a committed row's `run_at`, e.g. to skip past a backoff.
    pub fn set_run_at(&self, id: JobId, run_at: DateTime<Utc>) {
        if let Some(row) = self.state().rows.get_mut(&id) {
            row.run_at = run_at;
        }
    }

    /// Make the next insert, delete or failure update fail with a backend error.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        self.state().fail_write = Some(message.into());
    }

    /// Make the next `lock_job` fail with a backend error.
    pub fn fail_next_lock(&self, message: impl Into<String>) {
        self.state().fail_lock = Some(message.into());
    }

    /// Make the next `commit` fail with a backend error. The transaction's
    /// writes are discarded and its locks released.
    pub fn fail_next_commit(&self, message: impl Into<String>) {
        self.state().fail_commit = Some(message.into());
    }

    /// Simulate losing the connection: every later operation fails with
    /// [`LockqError::ConnectionLost`] and open transactions lose their locks.
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.disconnected = true;
        state.locks.clear();
    }
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ConnPool for MemoryPool {
    async fn begin(&self) -> Result<Box<dyn Tx>> {
        let mut state = self.state();
        state.check_connected()?;
        state.next_tx_id += 1;
        Ok(Box::new(MemoryTx {
            id: state.next_tx_id,
            state: Arc::clone(&self.state),
            pending: Vec::new(),
            finished: false,
        }))
    }

    async fn insert_job(&self, job: &NewJobRow) -> Result<JobId> {
        let mut state = self.state();
        state.check_write()?;
        let id = state.allocate_id();
        state.rows.insert(id, row_from(id, job));
        Ok(id)
    }
}

enum Write {
    Insert(JobRow),
    Delete(JobId),
    Failure(JobId, FailureUpdate),
}

/// Transaction over a [`MemoryPool`].
pub struct MemoryTx {
    id: u64,
    state: Arc<Mutex<State>>,
    pending: Vec<Write>,
    finished: bool,
}

impl MemoryTx {
    fn state(&self) -> MutexGuard<'_, State> {
        lock_state(&self.state)
    }

    fn deleted_here(&self, id: JobId) -> bool {
        self.pending
            .iter()
            .any(|w| matches!(w, Write::Delete(d) if *d == id))
    }
}

#[async_trait]
impl Tx for MemoryTx {
    async fn insert_job(&mut self, job: &NewJobRow) -> Result<JobId> {
        let id = {
            let mut state = self.state();
            state.check_write()?;
            state.allocate_id()
        };
        self.pending.push(Write::Insert(row_from(id, job)));
        Ok(id)
    }

    async fn lock_job(&mut self, query: &LockQuery) -> Result<Option<JobRow>> {
        let mut state = self.state();
        state.check_connected()?;
        if let Some(msg) = state.fail_lock.take() {
            return Err(LockqError::Backend(msg));
        }

        let found = state
            .rows
            .values()
            .filter(|row| query.matches(row))
            .filter(|row| state.locks.get(&row.id).map_or(true, |owner| *owner == self.id))
            .filter(|row| !self.deleted_here(row.id))
            .min_by_key(|row| (row.priority, row.id))
            .cloned();

        if let Some(row) = &found {
            state.locks.insert(row.id, self.id);
        }
        Ok(found)
    }

    async fn delete_job(&mut self, id: JobId) -> Result<()> {
        self.state().check_write()?;
        self.pending.push(Write::Delete(id));
        Ok(())
    }

    async fn record_failure(&mut self, id: JobId, update: &FailureUpdate) -> Result<()> {
        self.state().check_write()?;
        self.pending.push(Write::Failure(id, update.clone()));
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        self.finished = true;

        let mut state = lock_state(&self.state);
        if let Err(e) = state.check_connected() {
            state.release_locks(self.id);
            return Err(e);
        }
        if let Some(msg) = state.fail_commit.take() {
            state.release_locks(self.id);
            return Err(LockqError::Backend(msg));
        }
        for write in pending {
            match write {
                Write::Insert(row) => {
                    state.rows.insert(row.id, row);
                }
                Write::Delete(id) => {
                    state.rows.remove(&id);
                }
                Write::Failure(id, update) => {
                    if let Some(row) = state.rows.get_mut(&id) {
                        row.error_count = update.error_count;
                        row.last_error = Some(update.last_error);
                        row.run_at = update.run_at;
                    }
                }
            }
        }
        state.release_locks(self.id);
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        let mut state = lock_state(&self.state);
        state.release_locks(self.id);
        state.check_connected()
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            let id = self.id;
            lock_state(&self.state).release_locks(id);
        }
    }
}
