//! Background task worker.
//!
//! Claims due tasks from the [`TaskQueue`] under a lease and runs them on
//! the [`Pipeline`], at most `worker_concurrency` at a time. A task is
//! acknowledged once its handler returns `Ok`; a handler error leaves the
//! task leased, so it is redelivered when the lease runs out. Tasks that
//! keep failing are dropped after [`MAX_DELIVERIES`] attempts.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::JobsConfig;
use crate::pipeline::Pipeline;
use ragline_core::error::{RagError, Result};
use ragline_core::queue::{Task, TaskQueue};

pub const MAX_DELIVERIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    /// Sleep between empty claims.
    pub poll_interval: std::time::Duration,
    pub lease: chrono::Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            poll_interval: std::time::Duration::from_millis(config.worker_poll_ms),
            lease: chrono::Duration::seconds(config.lease_secs as i64),
        }
    }
}

pub struct Worker {
    pipeline: Arc<Pipeline>,
    queue: Arc<dyn TaskQueue>,
    semaphore: Arc<Semaphore>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        pipeline: Arc<Pipeline>,
        queue: Arc<dyn TaskQueue>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            pipeline,
            queue,
            semaphore: Arc::new(Semaphore::new(settings.concurrency)),
            settings,
        }
    }

    /// Claim and run the tasks due at `now`. Returns how many ran.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let tasks = self
            .queue
            .claim_due(now, self.settings.concurrency, self.settings.lease)
            .await?;
        let claimed = tasks.len();
        if claimed == 0 {
            return Ok(0);
        }
        debug!(claimed, "claimed tasks");

        let mut running = JoinSet::new();
        for task in tasks {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| RagError::storage(format!("worker semaphore closed: {}", e)))?;
            let pipeline = self.pipeline.clone();
            let queue = self.queue.clone();
            running.spawn(async move {
                let _permit = permit;
                run_task(&pipeline, queue.as_ref(), task, now).await;
            });
        }
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task handler panicked");
            }
        }
        Ok(claimed)
    }

    /// Run every task due now, repeating until none is left.
    pub async fn drain(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let ran = self.run_once(Utc::now()).await?;
            if ran == 0 {
                return Ok(total);
            }
            total += ran;
        }
    }

    /// Run until the queue is empty, jumping a virtual clock forward to the
    /// next scheduled task whenever nothing is due.
    ///
    /// Scheduled delays (backoff, polling, sync delay) cost no wall time,
    /// which makes whole pipeline runs deterministic in tests.
    pub async fn run_until_idle(&self, start: DateTime<Utc>, max_rounds: usize) -> Result<usize> {
        let mut now = start;
        let mut total = 0;
        for _ in 0..max_rounds {
            let ran = self.run_once(now).await?;
            total += ran;
            if ran > 0 {
                continue;
            }
            match self.queue.next_run_at().await? {
                Some(next) if next > now => now = next,
                // Only leased tasks remain.
                Some(_) => now = now + self.settings.lease,
                None => break,
            }
        }
        Ok(total)
    }

    /// Poll the queue until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(concurrency = self.settings.concurrency, "worker started");
        tokio::pin!(shutdown);
        loop {
            let ran = match self.run_once(Utc::now()).await {
                Ok(ran) => ran,
                Err(e) => {
                    warn!(error = %e, "failed to claim tasks");
                    0
                }
            };
            let pause = if ran > 0 {
                std::time::Duration::ZERO
            } else {
                self.settings.poll_interval
            };
            tokio::select! {
                _ = &mut shutdown => {
                    info!("worker stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

async fn run_task(pipeline: &Pipeline, queue: &dyn TaskQueue, task: Task, now: DateTime<Utc>) {
    let kind = task.payload.kind();
    match pipeline.handle_task(&task, now).await {
        Ok(()) => {
            if let Err(e) = queue.ack(&task.id).await {
                warn!(task_id = %task.id, kind, error = %e, "failed to acknowledge task");
            }
        }
        Err(e) if task.attempts >= MAX_DELIVERIES => {
            error!(task_id = %task.id, kind, attempts = task.attempts, error = %e, "task failed too many times, dropping");
            let message = format!("gave up after {} deliveries: {}", task.attempts, e);
            if let Err(e) = pipeline.abandon_task(&task, &message).await {
                warn!(task_id = %task.id, kind, error = %e, "failed to record abandoned task");
            }
            if let Err(e) = queue.ack(&task.id).await {
                warn!(task_id = %task.id, kind, error = %e, "failed to drop task");
            }
        }
        Err(e) => {
            warn!(task_id = %task.id, kind, attempts = task.attempts, error = %e, "task failed, will be redelivered");
        }
    }
}
