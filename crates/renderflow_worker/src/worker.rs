//! Worker event loop and scheduler host.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use renderflow_db::{DbPool, JobStore};
use renderflow_events::{EventBuffer, ProgressBus};
use renderflow_protocol::{JobId, Settings};
use renderflow_queue::{record_heartbeat, tasks, PeriodicSet, TaskQueue, WorkerTask};

use crate::handlers;

/// Dispatch backoff when the queue is empty.
const BACKOFF_BASE_MS: u64 = 50;
const BACKOFF_MAX_MS: u64 = 1_000;
const BACKOFF_JITTER_MS: u64 = 50;

/// Scheduler poll cadence.
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Worker configuration (plain data).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub queues: Vec<String>,
    /// Recycle after this many executed tasks to bound memory.
    pub max_tasks: u32,
}

impl WorkerConfig {
    /// Standard configuration: listens on both queues.
    pub fn new(worker_id: impl Into<String>, settings: &Settings) -> Self {
        Self {
            worker_id: worker_id.into(),
            queues: vec![
                tasks::GENERATION_QUEUE.to_string(),
                tasks::DEFAULT_QUEUE.to_string(),
            ],
            max_tasks: settings.worker_max_tasks,
        }
    }
}

/// Shared handles every handler runs against.
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: DbPool,
    pub queue: Arc<TaskQueue>,
    pub bus: Arc<ProgressBus>,
    pub buffer: Arc<EventBuffer>,
    pub settings: Settings,
}

/// Why the run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Task budget reached; supervisor should restart the process.
    Recycle,
    /// Shutdown was requested.
    Stopped,
}

/// Active worker.
pub struct Worker {
    config: WorkerConfig,
    ctx: WorkerContext,
    shutdown: CancellationToken,
    tasks_executed: u32,
}

impl Worker {
    pub fn new(config: WorkerConfig, ctx: WorkerContext) -> Self {
        Self {
            config,
            ctx,
            shutdown: CancellationToken::new(),
            tasks_executed: 0,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Main event loop: heartbeat, claim, execute, recycle.
    pub async fn run(&mut self) -> Result<WorkerExit> {
        info!(
            "Worker {} starting\n{}",
            self.config.worker_id,
            self.ctx.settings.boot_banner()
        );

        let queues: Vec<&str> = self.config.queues.iter().map(String::as_str).collect();
        let mut backoff_ms = BACKOFF_BASE_MS;

        loop {
            if self.shutdown.is_cancelled() {
                info!("Worker {} stopped", self.config.worker_id);
                return Ok(WorkerExit::Stopped);
            }

            self.heartbeat().await;

            match self.ctx.queue.claim(&queues, &self.config.worker_id).await {
                Ok(Some(task)) => {
                    backoff_ms = BACKOFF_BASE_MS;
                    self.execute(task).await;
                    self.tasks_executed += 1;
                    if self.tasks_executed >= self.config.max_tasks {
                        info!(
                            "Worker {} recycling after {} tasks",
                            self.config.worker_id, self.tasks_executed
                        );
                        return Ok(WorkerExit::Recycle);
                    }
                }
                Ok(None) => {
                    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)) => {}
                    }
                    backoff_ms = (backoff_ms * 2).min(BACKOFF_MAX_MS);
                }
                Err(e) => {
                    error!("Claim failed: {e}");
                    tokio::time::sleep(Duration::from_millis(BACKOFF_MAX_MS)).await;
                }
            }
        }
    }

    /// Claim and execute at most one task. Used by tests and drain tooling.
    pub async fn run_once(&mut self) -> Result<bool> {
        let queues: Vec<&str> = self.config.queues.iter().map(String::as_str).collect();
        self.heartbeat().await;
        match self.ctx.queue.claim(&queues, &self.config.worker_id).await? {
            Some(task) => {
                self.execute(task).await;
                self.tasks_executed += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn heartbeat(&self) {
        if let Err(e) = record_heartbeat(
            &self.ctx.pool,
            &self.config.worker_id,
            &hostname(),
            std::process::id() as i64,
            self.tasks_executed as i64,
        )
        .await
        {
            warn!("Heartbeat failed: {e}");
        }
    }

    /// Execute one claimed task under its cancellation token and hard time
    /// limit, then settle the queue row.
    async fn execute(&self, task: WorkerTask) {
        info!("Executing task {}: {}", task.id, task.task_name);
        let registry = self.ctx.queue.cancel_registry();
        let cancel = registry.register(&task.dispatch_token);
        let started = Instant::now();

        let hard_limit = task
            .hard_limit_secs
            .map(|secs| Duration::from_secs(secs as u64));

        enum Settled {
            Done(renderflow_protocol::error::EngineResult<serde_json::Value>),
            TimedOut,
            Cancelled,
        }

        let settled = {
            let work = handlers::dispatch(&self.ctx, &task);
            tokio::pin!(work);
            tokio::select! {
                _ = cancel.cancelled() => Settled::Cancelled,
                result = async {
                    match hard_limit {
                        Some(limit) => match tokio::time::timeout(limit, &mut work).await {
                            Ok(result) => Settled::Done(result),
                            Err(_) => Settled::TimedOut,
                        },
                        None => Settled::Done((&mut work).await),
                    }
                } => result,
            }
        };

        registry.remove(&task.dispatch_token);

        if let Some(soft) = task.soft_limit_secs {
            let elapsed = started.elapsed();
            if elapsed > Duration::from_secs(soft as u64) {
                warn!(
                    "Task {} exceeded its soft time limit ({}s > {}s)",
                    task.id,
                    elapsed.as_secs(),
                    soft
                );
            }
        }

        match settled {
            Settled::Done(Ok(result)) => {
                if let Err(e) = self.ctx.queue.complete(task.id).await {
                    error!("Failed to complete task {}: {}", task.id, e);
                }
                info!("Task {} done: {}", task.id, result);
            }
            Settled::Done(Err(exc)) => {
                let retryable = exc.is_retryable();
                match self
                    .ctx
                    .queue
                    .fail(task.id, &exc.to_string(), retryable)
                    .await
                {
                    Ok(outcome) => info!("Task {} failed ({outcome:?}): {exc}", task.id),
                    Err(e) => error!("Failed to record task {} failure: {}", task.id, e),
                }
            }
            Settled::TimedOut => {
                error!("Task {} hit its hard time limit, terminating", task.id);
                if let Err(e) = self
                    .ctx
                    .queue
                    .fail(task.id, "hard time limit exceeded", false)
                    .await
                {
                    error!("Failed to record task {} timeout: {}", task.id, e);
                }
                self.settle_generation_job(&task, "hard time limit exceeded")
                    .await;
            }
            Settled::Cancelled => {
                warn!("Task {} terminated by revocation", task.id);
                if let Err(e) = self.ctx.queue.mark_revoked(task.id).await {
                    error!("Failed to mark task {} revoked: {}", task.id, e);
                }
            }
        }
    }

    /// A hard-killed generation attempt leaves its job `running`; flip it to
    /// failed and tell subscribers.
    async fn settle_generation_job(&self, task: &WorkerTask, message: &str) {
        if task.task_name != tasks::RUN_GENERATION_JOB {
            return;
        }
        let Some(job_id) = task.args.0.get("job_id").and_then(serde_json::Value::as_i64) else {
            return;
        };
        let job_id = JobId::new(job_id);
        let jobs = JobStore::new(self.ctx.pool.clone());
        match jobs.mark_failed(job_id, message).await {
            Ok(_) => {
                self.ctx.bus.publish_failed(job_id, message);
            }
            Err(e) => warn!("Could not settle job {job_id} after timeout: {e}"),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Periodic scheduler loop: poll the schedule set, enqueue whatever is due.
pub async fn run_scheduler(
    queue: Arc<TaskQueue>,
    mut schedule: PeriodicSet,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Scheduler hosting {} periodic entries", schedule.len());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Scheduler stopped");
                return Ok(());
            }
            _ = tokio::time::sleep(SCHEDULER_TICK) => {}
        }

        for task_name in schedule.poll(Utc::now()) {
            match queue.enqueue(&task_name, json!({})).await {
                Ok(token) => info!("Scheduled {} ({})", task_name, token),
                Err(e) => error!("Failed to enqueue scheduled task {}: {}", task_name, e),
            }
        }
    }
}
