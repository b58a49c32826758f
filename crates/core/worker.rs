//! Worker that polls one queue and executes the jobs it claims.

use std::any::Any;
use std::sync::Arc;

use crate::client::Client;
use crate::config::WorkerConfig;
use crate::error::{LockqError, Result};
use crate::handler::{HandlerFn, JobContext, JobError, JobResult, WorkMap};
use crate::ident::new_id;
use crate::job::{Job, JobId};
use crate::shutdown::Shutdown;

/// What a single poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// A job was claimed, executed and settled.
    Worked,
    /// Nothing was eligible.
    Idle,
    /// A job was claimed but its type is not handled here; the claim was released.
    Unhandled(JobId),
}

/// Individual worker that claims and processes jobs.
///
/// A worker runs one job at a time: claim, execute, settle, repeat. It only
/// sleeps when a poll comes back empty.
#[derive(Clone)]
pub struct Worker {
    id: String,
    client: Client,
    work_map: Arc<WorkMap>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(client: Client, work_map: impl Into<Arc<WorkMap>>, config: WorkerConfig) -> Result<Self> {
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

    /// Poll until `shutdown` is triggered.
    ///
    /// A job claimed before shutdown is still executed and settled. Store
    /// errors are logged and retried after the poll interval, except a lost
    /// connection, which stops the worker with that error.
    pub async fn run(&self, shutdown: Shutdown) -> Result<()> {
        tracing::info!(
            worker_id = %self.id,
            queue = %self.config.queue,
            "Worker started"
        );

        let mut last_unhandled = None;

        while !shutdown.is_triggered() {
            match self.work_one(&shutdown).await {
                Ok(WorkOutcome::Worked) => {
                    last_unhandled = None;
                }
                Ok(WorkOutcome::Idle) => {
                    last_unhandled = None;
                    self.idle(&shutdown).await;
                }
                Ok(WorkOutcome::Unhandled(id)) => {
                    // Re-poll at once so the job is not stuck behind our
                    // sleep, unless we just got the very same job back.
                    if last_unhandled == Some(id) {
                        self.idle(&shutdown).await;
                    }
                    last_unhandled = Some(id);
                }
                Err(e) if e.is_connection_lost() => {
                    tracing::error!(worker_id = %self.id, error = %e, "Store connection lost, stopping worker");
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "Worker error");
                    self.idle(&shutdown).await;
                }
            }
        }

        tracing::info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    async fn idle(&self, shutdown: &Shutdown) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = shutdown.wait() => {}
        }
    }

    /// Claim at most one job, execute it and settle it.
    pub async fn work_one(&self, shutdown: &Shutdown) -> Result<WorkOutcome> {
        let claimed = if self.config.min_error_count > 0 {
            self.client
                .lock_job_min_error(&self.config.queue, self.config.min_error_count)
                .await?
        } else {
            self.client
                .lock_job(&self.config.queue, self.config.max_error_count)
                .await?
        };

        let Some(mut job) = claimed else {
            return Ok(WorkOutcome::Idle);
        };

        let handler = match self.handler_for(job.job_type()) {
            Some(handler) => handler,
            None if self.config.all_jobs => {
                let message = format!("unknown job type: {}", job.job_type());
                tracing::warn!(worker_id = %self.id, job_id = %job.id(), "{message}");
                job.error(&message).await?;
                return Ok(WorkOutcome::Worked);
            }
            None => {
                tracing::debug!(
                    worker_id = %self.id,
                    job_id = %job.id(),
                    job_type = %job.job_type(),
                    "Job type not handled by this worker, releasing"
                );
                job.release().await?;
                return Ok(WorkOutcome::Unhandled(job.id()));
            }
        };

        self.execute(job, handler, shutdown).await?;
        Ok(WorkOutcome::Worked)
    }

    fn handler_for(&self, job_type: &str) -> Option<HandlerFn> {
        match self.work_map.get(job_type) {
            Some(handler) => Some(Arc::clone(handler)),
            None if self.config.all_jobs => self.work_map.get_fallback().cloned(),
            None => None,
        }
    }

    /// Run the handler and settle the job on a task of their own.
    ///
    /// The task owns the job, so the row lock is held until the handler has
    /// finished and its outcome is recorded, even if this future is dropped.
    async fn execute(&self, job: Job, handler: HandlerFn, shutdown: &Shutdown) -> Result<()> {
        tracing::debug!(
            worker_id = %self.id,
            job_id = %job.id(),
            job_type = %job.job_type(),
            "Processing job"
        );

        let ctx = JobContext {
            job: job.row().clone(),
            shutdown: shutdown.clone(),
        };

        match tokio::spawn(run_and_settle(self.id.clone(), job, handler, ctx)).await {
            Ok(settled) => settled,
            Err(e) => Err(LockqError::WorkerPanicked(e.to_string())),
        }
    }
}

async fn run_and_settle(
    worker_id: String,
    mut job: Job,
    handler: HandlerFn,
    ctx: JobContext,
) -> Result<()> {
    // Nested task so a panicking handler leaves the job here to settle.
    let result: JobResult = match tokio::spawn(handler(ctx)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(JobError::new(format!(
            "panic: {}",
            panic_message(e.into_panic())
        ))),
        Err(e) => Err(JobError::new(format!("handler task failed: {e}"))),
    };

    match result {
        Ok(()) => {
            job.done().await?;
            tracing::debug!(worker_id = %worker_id, job_id = %job.id(), "Job completed successfully");
        }
        Err(err) => {
            tracing::warn!(
                worker_id = %worker_id,
                job_id = %job.id(),
                error_count = job.error_count() + 1,
                error = %err,
                "Job failed"
            );
            job.error(&err.message).await?;
        }
    }
    Ok(())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Constant;
    use crate::job::NewJob;
    use crate::memory::MemoryPool;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn client(pool: &MemoryPool) -> Client {
        Client::new(pool.clone()).with_backoff(Arc::new(Constant(Duration::from_secs(60))))
    }

    fn config() -> WorkerConfig {
        WorkerConfig::builder()
            .queue("q")
            .poll_interval(Duration::from_millis(10))
            .id("test-worker")
            .build()
            .unwrap()
    }

    async fn enqueue(client: &Client, job_type: &str) -> JobId {
        client
            .enqueue(&mut NewJob::new(job_type).queue("q"))
            .await
            .unwrap()
    }

    async fn explode(_ctx: JobContext) -> JobResult {
        panic!("handler exploded")
    }

    fn counting_map(job_type: &str, counter: Arc<AtomicUsize>) -> WorkMap {
        WorkMap::new().register(job_type, move |_ctx: JobContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_work_one_success_deletes_job() {
        let pool = MemoryPool::new();
        let client = client(&pool);
        let counter = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new(client.clone(), counting_map("t", counter.clone()), config()).unwrap();
        let id = enqueue(&client, "t").await;

        let outcome = worker.work_one(&Shutdown::new()).await.unwrap();
        assert_eq!(outcome, WorkOutcome::Worked);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(pool.get(id).is_none());
        assert_eq!(worker.work_one(&Shutdown::new()).await.unwrap(), WorkOutcome::Idle);
    }

    #[tokio::test]
    async fn test_work_one_handler_error_reschedules() {
        let pool = MemoryPool::new();
        let client = client(&pool);
        let map = WorkMap::new().register("t", |_ctx: JobContext| async {
            Err(JobError::new("smtp unavailable"))
        });
        let worker = Worker::new(client.clone(), map, config()).unwrap();
        let id = enqueue(&client, "t").await;

        assert_eq!(worker.work_one(&Shutdown::new()).await.unwrap(), WorkOutcome::Worked);

        let row = pool.get(id).unwrap();
        assert_eq!(row.error_count, 1);
        assert_eq!(row.last_error.as_deref(), Some("smtp unavailable"));
        assert!(row.run_at > Utc::now());
        assert_eq!(pool.locked_count(), 0);
    }

    #[tokio::test]
    async fn test_work_one_recovers_from_panic() {
        let pool = MemoryPool::new();
        let client = client(&pool);
        let worker = Worker::new(client.clone(), WorkMap::new().register("t", explode), config()).unwrap();
        let id = enqueue(&client, "t").await;

        assert_eq!(worker.work_one(&Shutdown::new()).await.unwrap(), WorkOutcome::Worked);

        let row = pool.get(id).unwrap();
        assert_eq!(row.error_count, 1);
        assert_eq!(row.last_error.as_deref(), Some("panic: handler exploded"));
        assert_eq!(pool.locked_count(), 0);
    }

    #[tokio::test]
    async fn test_work_one_releases_unhandled_type() {
        let pool = MemoryPool::new();
        let client = client(&pool);
        let counter = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new(client.clone(), counting_map("t", counter.clone()), config()).unwrap();
        let id = enqueue(&client, "other").await;
        let before = pool.get(id).unwrap();

        let outcome = worker.work_one(&Shutdown::new()).await.unwrap();
        assert_eq!(outcome, WorkOutcome::Unhandled(id));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(pool.get(id).unwrap(), before);
        assert_eq!(pool.locked_count(), 0);
    }

    #[tokio::test]
    async fn test_all_jobs_uses_fallback() {
        let pool = MemoryPool::new();
        let client = client(&pool);
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let map = WorkMap::new().fallback(move |_ctx: JobContext| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let config = WorkerConfig {
            all_jobs: true,
            ..config()
        };
        let worker = Worker::new(client.clone(), map, config).unwrap();
        let id = enqueue(&client, "anything").await;

        assert_eq!(worker.work_one(&Shutdown::new()).await.unwrap(), WorkOutcome::Worked);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(pool.get(id).is_none());
    }

    #[tokio::test]
    async fn test_all_jobs_without_fallback_records_error() {
        let pool = MemoryPool::new();
        let client = client(&pool);
        let config = WorkerConfig {
            all_jobs: true,
            ..config()
        };
        let worker = Worker::new(client.clone(), WorkMap::new(), config).unwrap();
        let id = enqueue(&client, "mystery").await;

        assert_eq!(worker.work_one(&Shutdown::new()).await.unwrap(), WorkOutcome::Worked);
        let row = pool.get(id).unwrap();
        assert_eq!(row.error_count, 1);
        assert_eq!(row.last_error.as_deref(), Some("unknown job type: mystery"));
    }

    #[tokio::test]
    async fn test_max_error_count_skips_failing_jobs() {
        let pool = MemoryPool::new();
        let client = client(&pool);
        let counter = Arc::new(AtomicUsize::new(0));
        let config = WorkerConfig {
            max_error_count: 1,
            ..config()
        };
        let worker = Worker::new(client.clone(), counting_map("t", counter.clone()), config).unwrap();
        let id = enqueue(&client, "t").await;

        let mut job = client.lock_job("q", 0).await.unwrap().unwrap();
        job.error("first failure").await.unwrap();
        pool.set_run_at(id, Utc::now());

        assert_eq!(worker.work_one(&Shutdown::new()).await.unwrap(), WorkOutcome::Idle);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_min_error_count_sweeps_only_failing_jobs() {
        let pool = MemoryPool::new();
        let client = client(&pool);
        let counter = Arc::new(AtomicUsize::new(0));
        let config = WorkerConfig {
            min_error_count: 1,
            ..config()
        };
        let worker = Worker::new(client.clone(), counting_map("t", counter.clone()), config).unwrap();
        let healthy = enqueue(&client, "t").await;

        assert_eq!(worker.work_one(&Shutdown::new()).await.unwrap(), WorkOutcome::Idle);

        let failing = enqueue(&client, "t").await;
        pool.set_run_at(healthy, Utc::now() + chrono::Duration::hours(1));
        let mut job = client.lock_job("q", 0).await.unwrap().unwrap();
        assert_eq!(job.id(), failing);
        job.error("broken").await.unwrap();

        assert_eq!(worker.work_one(&Shutdown::new()).await.unwrap(), WorkOutcome::Worked);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(pool.get(failing).is_none());
        assert!(pool.get(healthy).is_some());
    }

    #[tokio::test]
    async fn test_run_processes_jobs_until_shutdown() {
        let pool = MemoryPool::new();
        let client = client(&pool);
        let counter = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new(client.clone(), counting_map("t", counter.clone()), config()).unwrap();
        for _ in 0..3 {
            enqueue(&client, "t").await;
        }

        let shutdown = Shutdown::new();
        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should stop promptly")
            .unwrap()
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_run_finishes_in_flight_job_on_shutdown() {
        let pool = MemoryPool::new();
        let client = client(&pool);
        let started = Arc::new(tokio::sync::Notify::new());
        let map = {
            let started = started.clone();
            WorkMap::new().register("slow", move |_ctx: JobContext| {
                let started = started.clone();
                async move {
                    started.notify_one();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                }
            })
        };
        let worker = Worker::new(client.clone(), map, config()).unwrap();
        let id = enqueue(&client, "slow").await;

        let shutdown = Shutdown::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        started.notified().await;
        shutdown.trigger();
        handle.await.unwrap().unwrap();

        assert!(pool.get(id).is_none());
        assert_eq!(pool.locked_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_job_locked_until_settled() {
        let pool = MemoryPool::new();
        let client = client(&pool);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let map = {
            let (running, peak) = (running.clone(), peak.clone());
            WorkMap::new().register("slow", move |_ctx: JobContext| {
                let (running, peak) = (running.clone(), peak.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let first = Worker::new(client.clone(), map.clone(), config()).unwrap();
        let second = Worker::new(client.clone(), map, config()).unwrap();
        let id = enqueue(&client, "slow").await;

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), first.run(Shutdown::new())).await;
        assert!(cancelled.is_err());

        assert_eq!(pool.locked_count(), 1);
        assert_eq!(second.work_one(&Shutdown::new()).await.unwrap(), WorkOutcome::Idle);

        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.get(id).is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job should still be settled");
        assert_eq!(pool.locked_count(), 0);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_connection_loss() {
        let pool = MemoryPool::new();
        let worker = Worker::new(client(&pool), WorkMap::new(), config()).unwrap();
        pool.disconnect();

        let err = tokio::time::timeout(Duration::from_secs(1), worker.run(Shutdown::new()))
            .await
            .expect("worker should not spin")
            .unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn test_run_survives_transient_errors() {
        let pool = MemoryPool::new();
        let client = client(&pool);
        let counter = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new(client.clone(), counting_map("t", counter.clone()), config()).unwrap();
        enqueue(&client, "t").await;
        pool.fail_next_lock("serialization failure");

        let shutdown = Shutdown::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();
        handle.await.unwrap().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_new_generates_id() {
        let config = WorkerConfig {
            id: None,
            ..WorkerConfig::default()
        };
        let worker = Worker::new(client(&MemoryPool::new()), WorkMap::new(), config).unwrap();
        assert_eq!(worker.id().len(), 6);
    }

    #[test]
    fn test_new_validates_config() {
        let config = WorkerConfig {
            poll_interval: Duration::ZERO,
            ..WorkerConfig::default()
        };
        assert!(Worker::new(client(&MemoryPool::new()), WorkMap::new(), config).is_err());
    }
}
