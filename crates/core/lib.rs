//! # lockq-core - Core types and traits for the lockq job queue
//!
//! Jobs live as rows in a relational table. A worker claims a job by taking
//! a row lock inside a transaction and holds that transaction open while the
//! job runs; finishing the job deletes the row or records the failure in the
//! same transaction. If the worker dies, the transaction rolls back and the
//! job becomes claimable again.
//!
//! This crate provides:
//! - `ConnPool` / `Tx` traits for store implementations, plus `MemoryPool`
//! - `Client` for enqueueing and claiming jobs
//! - `Job` with `done`, `error` and `release`
//! - `Backoff` policies for rescheduling failed jobs
//! - `Worker` and `WorkerPool` for processing jobs
//! - Error types

mod backoff;
mod client;
mod config;
mod error;
mod handler;
mod ident;
mod job;
mod memory;
mod pool;
mod shutdown;
mod store;
mod worker;

// Re-export main types
pub use backoff::{Backoff, Constant, DynBackoff, Exponential, Linear};
pub use client::Client;
pub use config::{PoolConfig, PoolConfigBuilder, WorkerConfig, WorkerConfigBuilder};
pub use error::{LockqError, Result};
pub use handler::{HandlerFn, JobContext, JobError, JobResult, WorkMap};
pub use ident::new_id;
pub use job::{Job, JobId, JobRow, NewJob};
pub use memory::{MemoryPool, MemoryTx};
pub use pool::{WorkerPool, WorkerPoolHandle};
pub use shutdown::Shutdown;
pub use store::{ConnPool, DynPool, FailureUpdate, LockQuery, NewJobRow, SharedPool, Tx};
pub use worker::{WorkOutcome, Worker};
