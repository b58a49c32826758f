//! Job handlers and the registry that dispatches to them by job type.

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::job::JobRow;
use crate::shutdown::Shutdown;

/// Result type for job handlers.
pub type JobResult = std::result::Result<(), JobError>;

/// Error returned from job handlers.
///
/// The message is stored as the job's `last_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    /// Error message.
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

/// What a handler gets to work with.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Snapshot of the claimed row.
    pub job: JobRow,
    /// Triggered when the worker is asked to stop. Long handlers should
    /// watch it and return early. Returning `Err` reschedules the job;
    /// returning `Ok(())` deletes it as done.
    pub shutdown: Shutdown,
}

impl JobContext {
    /// Decode the job's JSON arguments.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T> {
        self.job.args_json()
    }
}

type BoxFuture = Pin<Box<dyn Future<Output = JobResult> + Send + 'static>>;

/// Type-erased handler.
pub type HandlerFn = Arc<dyn Fn(JobContext) -> BoxFuture + Send + Sync>;

fn boxed<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)) as BoxFuture)
}

/// Registry mapping job types to handlers.
#[derive(Clone, Default)]
pub struct WorkMap {
    handlers: HashMap<String, HandlerFn>,
    fallback: Option<HandlerFn>,
}

impl WorkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `job_type`, replacing any previous one.
    pub fn register<F, Fut>(mut self, job_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.handlers.insert(job_type.into(), boxed(handler));
        self
    }

    /// Handler used by all-jobs workers for types without a registered handler.
    pub fn fallback<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.fallback = Some(boxed(handler));
        self
    }

    /// Handler registered for exactly this type.
    pub fn get(&self, job_type: &str) -> Option<&HandlerFn> {
        self.handlers.get(job_type)
    }

    pub fn get_fallback(&self) -> Option<&HandlerFn> {
        self.fallback.as_ref()
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.fallback.is_none()
    }
}

impl fmt::Debug for WorkMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkMap")
            .field("job_types", &self.job_types())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
