//! Generation job business logic: submission, cancellation, reconciliation
//! and queue statistics.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use renderflow_db::{
    ContentStore, DbPool, Job, JobStore, NewJob, NotificationStore, QueueTotals, UserStore,
};
use renderflow_protocol::error::{EngineError, EngineResult};
use renderflow_protocol::{
    BackendKind, JobId, JobKind, JobStatus, LoraModel, SamplerParams, Settings,
};
use renderflow_queue::{tasks, TaskQueue, WorkerHealthProbe};

use crate::telemetry::GenerationEventRecorder;

/// Submission payload, matching the REST contract minus marshaling.
#[derive(Debug, Clone, Default)]
pub struct CreateJobRequest {
    pub user_id: Uuid,
    pub job_type: JobKind,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub checkpoint_model: Option<String>,
    pub lora_models: Vec<LoraModel>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub batch_size: Option<u32>,
    pub sampler_params: Option<SamplerParams>,
    pub params: Option<Map<String, Value>>,
    pub backend: Option<BackendKind>,
}

/// Service owning the submission/cancellation side of the lifecycle.
pub struct GenerationService {
    jobs: JobStore,
    users: UserStore,
    content: ContentStore,
    notifications: NotificationStore,
    queue: Arc<TaskQueue>,
    probe: WorkerHealthProbe,
    recorder: Option<GenerationEventRecorder>,
    settings: Settings,
}

impl GenerationService {
    pub fn new(
        pool: DbPool,
        queue: Arc<TaskQueue>,
        probe: WorkerHealthProbe,
        settings: Settings,
    ) -> Self {
        Self {
            jobs: JobStore::new(pool.clone()),
            users: UserStore::new(pool.clone()),
            content: ContentStore::new(pool.clone()),
            notifications: NotificationStore::new(pool),
            queue,
            probe,
            recorder: None,
            settings,
        }
    }

    /// Attach a telemetry recorder; submissions and cancellations then emit
    /// generation events.
    pub fn with_recorder(mut self, recorder: GenerationEventRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Create a generation job: worker-health gate, validation,
    /// normalization, persist, enqueue.
    pub async fn create(&self, request: CreateJobRequest) -> EngineResult<Job> {
        if !self.probe.workers_available().await {
            return Err(EngineError::WorkersUnavailable);
        }

        let user = self.users.get(request.user_id).await?;
        if !user.is_active {
            return Err(EngineError::validation(
                "Cannot create generation jobs for inactive users",
            ));
        }

        let prompt = request.prompt.trim().to_string();
        let mut params = request.params.unwrap_or_default();

        // Backend selector: explicit argument, then params, then primary.
        let backend = match request.backend {
            Some(backend) => backend,
            None => params
                .get("backend")
                .and_then(Value::as_str)
                .map(|raw| raw.parse().map_err(EngineError::Validation))
                .transpose()?
                .unwrap_or_default(),
        };
        params.insert("backend".into(), Value::String(backend.as_str().into()));

        let sampler_params = request
            .sampler_params
            .or_else(|| {
                params
                    .get("sampler_params")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
            })
            .unwrap_or_default();

        let is_image_job = request.job_type == JobKind::Image;
        let (checkpoint, width, height, batch_size) = if is_image_job {
            (
                request
                    .checkpoint_model
                    .or_else(|| Some(self.settings.default_checkpoint.clone())),
                request.width.or(Some(self.settings.default_width)),
                request.height.or(Some(self.settings.default_height)),
                request.batch_size.or(Some(self.settings.default_batch_size)),
            )
        } else {
            (
                request.checkpoint_model,
                request.width,
                request.height,
                request.batch_size,
            )
        };

        // Mirror the resolved fields into the params map forwarded to the
        // backend, so the stored job echoes its effective configuration.
        if is_image_job {
            params.insert(
                "negative_prompt".into(),
                Value::String(request.negative_prompt.clone().unwrap_or_default()),
            );
            if let Some(checkpoint) = &checkpoint {
                params.insert("checkpoint_model".into(), Value::String(checkpoint.clone()));
            }
            params.insert("width".into(), Value::from(width.unwrap_or_default()));
            params.insert("height".into(), Value::from(height.unwrap_or_default()));
            params.insert(
                "batch_size".into(),
                Value::from(batch_size.unwrap_or_default()),
            );
            params.insert(
                "sampler_params".into(),
                serde_json::to_value(&sampler_params)
                    .map_err(|e| EngineError::internal(e.to_string()))?,
            );
        }

        let job = self
            .jobs
            .insert(NewJob {
                user_id: request.user_id,
                job_type: request.job_type,
                prompt,
                negative_prompt: request.negative_prompt,
                checkpoint_model: checkpoint,
                lora_models: request.lora_models,
                width,
                height,
                batch_size,
                sampler_params,
                params,
                backend,
            })
            .await?;

        let token = self
            .queue
            .enqueue(
                tasks::RUN_GENERATION_JOB,
                serde_json::json!({ "job_id": job.id }),
            )
            .await?;
        self.jobs.set_dispatch_token(job.job_id(), &token).await?;

        if let Some(recorder) = &self.recorder {
            recorder.record_request(&job);
        }

        info!("Job {} queued (token {})", job.id, token);
        self.jobs.get(job.job_id()).await.map_err(Into::into)
    }

    pub async fn get_job(&self, job_id: JobId) -> EngineResult<Job> {
        self.jobs.get(job_id).await.map_err(Into::into)
    }

    pub async fn get_user_jobs(
        &self,
        user_id: Uuid,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<Job>> {
        self.users.get(user_id).await?;
        Ok(self
            .jobs
            .list_by_user(&user_id.to_string(), status, limit, offset)
            .await?)
    }

    pub async fn get_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<Job>> {
        Ok(self.jobs.list_by_status(status, limit, offset).await?)
    }

    pub async fn get_jobs_by_kind(
        &self,
        kind: JobKind,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<Job>> {
        Ok(self.jobs.list_by_kind(kind, limit, offset).await?)
    }

    pub async fn get_completed_jobs(
        &self,
        user_id: Option<Uuid>,
        days: i64,
        limit: i64,
    ) -> EngineResult<Vec<Job>> {
        let user_key = match user_id {
            Some(id) => {
                self.users.get(id).await?;
                Some(id.to_string())
            }
            None => None,
        };
        Ok(self
            .jobs
            .completed_within_days(user_key.as_deref(), days, limit)
            .await?)
    }

    /// Job counts per status.
    pub async fn queue_statistics(&self) -> EngineResult<QueueTotals> {
        Ok(self.jobs.count_by_status().await?)
    }

    /// Update a pending job's params.
    pub async fn update_job(
        &self,
        job_id: JobId,
        params: Map<String, Value>,
    ) -> EngineResult<Job> {
        Ok(self.jobs.update_params(job_id, &params).await?)
    }

    /// Delete a terminal job.
    pub async fn delete_job(&self, job_id: JobId) -> EngineResult<()> {
        Ok(self.jobs.delete(job_id).await?)
    }

    /// Cancel a job. Pre-dispatch: flip the row. Post-dispatch: revoke the
    /// task with terminate, then flip the row. Revocation failures are
    /// logged, never fatal.
    pub async fn cancel(&self, job_id: JobId, reason: Option<&str>) -> EngineResult<Job> {
        let job = self.jobs.get(job_id).await?;
        if !job.status.is_cancellable() {
            return Err(EngineError::validation(format!(
                "Cannot cancel job {job_id} with status '{}'. Only pending or running jobs can be cancelled.",
                job.status
            )));
        }

        if let Some(token) = &job.dispatch_token {
            match self.queue.revoke(token, true).await {
                Ok(signalled) => {
                    if signalled {
                        info!("Revoked dispatch {} for job {}", token, job_id);
                    }
                }
                Err(e) => warn!("Failed to revoke dispatch {} for job {}: {}", token, job_id, e),
            }
        }

        let cancelled = self.jobs.mark_cancelled(job_id, reason).await?;
        if let Some(recorder) = &self.recorder {
            recorder.record_cancellation(&cancelled);
        }
        Ok(cancelled)
    }

    // ------------------------------------------------------------------
    // Finalization API (reconciliation and tests)
    // ------------------------------------------------------------------

    /// pending -> running.
    pub async fn start(&self, job_id: JobId) -> EngineResult<Job> {
        Ok(self.jobs.mark_running(job_id).await?)
    }

    /// running -> completed; verifies the content row exists.
    pub async fn complete(&self, job_id: JobId, content_id: i64) -> EngineResult<Job> {
        self.content.get(content_id).await?;
        Ok(self.jobs.mark_completed(job_id, content_id, None).await?)
    }

    /// {pending, running} -> failed; error must be non-empty.
    pub async fn fail(&self, job_id: JobId, error_message: &str) -> EngineResult<Job> {
        Ok(self.jobs.mark_failed(job_id, error_message).await?)
    }

    /// Best-effort failure notification, used by rescue tooling alongside
    /// `fail`. Errors are logged and swallowed.
    pub async fn notify_failure(&self, job_id: JobId, error_message: &str) {
        match self.jobs.get(job_id).await {
            Ok(job) => {
                if let Err(e) = self
                    .notifications
                    .create_job_failure(&job.user_id, job_id, error_message)
                    .await
                {
                    warn!("Failed to create failure notification for job {job_id}: {e}");
                }
            }
            Err(e) => warn!("Failed to load job {job_id} for failure notification: {e}"),
        }
    }
}
