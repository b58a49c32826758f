//! Basic demo of the lockq job queue.
//!
//! This demo:
//! - Uses PostgreSQL when `DATABASE_URL` is set, otherwise the in-memory store
//! - Enqueues a handful of jobs from a client
//! - Processes them with a worker pool, retrying a flaky job with backoff
//!
//! Run with: `cargo run -p demo-basic`
//! Log level is controlled by `RUST_LOG` (default `info`).

use lockq_core::{
    Client, Exponential, JobContext, JobError, JobResult, MemoryPool, NewJob, PoolConfig,
    SharedPool, WorkMap, WorkerPool,
};
use lockq_postgres::PgConnPool;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Email notification job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailJob {
    to: String,
    subject: String,
}

async fn send_email(ctx: JobContext) -> JobResult {
    let email: EmailJob = ctx.args()?;
    tracing::info!(job_id = %ctx.job.id, to = %email.to, subject = %email.subject, "Sending email");

    // Simulate some work
    tokio::time::sleep(Duration::from_millis(300)).await;
    Ok(())
}

async fn store() -> lockq_core::Result<SharedPool> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = PgConnPool::connect(&url).await?;
            pool.migrate().await?;
            tracing::info!(table = %pool.table(), "Using PostgreSQL store");
            Ok(SharedPool::new(pool))
        }
        Err(_) => {
            tracing::info!("DATABASE_URL not set, using in-memory store");
            Ok(SharedPool::new(MemoryPool::new()))
        }
    }
}

#[tokio::main]
async fn main() -> lockq_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let client = Client::with_pool(store().await?)
        .with_id("demo")
        .with_backoff(Arc::new(Exponential::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
        )));

    let emails = [
        ("alice@example.com", "Welcome!"),
        ("bob@example.com", "Your order shipped"),
        ("charlie@example.com", "Password reset"),
        ("diana@example.com", "Weekly digest"),
    ];

    for (to, subject) in emails {
        let mut job = NewJob::new("send_email").json_args(&EmailJob {
            to: to.to_string(),
            subject: subject.to_string(),
        })?;
        let job_id = client.enqueue(&mut job).await?;
        tracing::info!(%job_id, "Enqueued email");
    }

    // Runs ahead of the emails.
    let job_id = client
        .enqueue(&mut NewJob::new("generate_report").priority(-1))
        .await?;
    tracing::info!(%job_id, "Enqueued report");

    // Fails twice before succeeding.
    let attempts = Arc::new(AtomicU32::new(0));
    let work_map = WorkMap::new()
        .register("send_email", send_email)
        .register("generate_report", move |ctx: JobContext| {
            let attempts = attempts.clone();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    return Err(JobError::new(format!(
                        "report backend busy (attempt {attempt})"
                    )));
                }
                tracing::info!(job_id = %ctx.job.id, attempt, "Report generated");
                Ok(())
            }
        });

    let config = PoolConfig::builder()
        .num_workers(2)
        .poll_interval(Duration::from_millis(500))
        .build()?;

    tracing::info!("Starting worker pool, press Ctrl+C to stop");
    WorkerPool::new(client, work_map, config)?.run().await
}
