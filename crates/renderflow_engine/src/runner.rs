//! Worker-side job execution.
//!
//! `process_generation_job` drives one job through dispatch, polling,
//! collection and finalization, publishing progress at each edge. Any error
//! after the job goes `running` rolls the row to `failed` and re-raises so
//! the queue's retry policy can decide.

use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use renderflow_db::{ContentStore, DbPool, Job, JobStore, NewContent, NotificationStore};
use renderflow_events::ProgressBus;
use renderflow_protocol::defaults::CONTENT_TITLE_MAX_CHARS;
use renderflow_protocol::error::{EngineError, EngineResult};
use renderflow_protocol::{
    BackendKind, GenerationRequest, JobId, LoraModel, SamplerParams, Settings,
};

use crate::backend::BackendJobStatus;
use crate::collaborators::JobCollaborators;
use crate::telemetry::GenerationEventRecorder;

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Outputs collected, content persisted.
    Completed {
        content_id: i64,
        output_paths: Vec<String>,
    },
    /// The job was already terminal when the worker picked the task up; the
    /// attempt is a no-op (at-least-once delivery must not re-submit).
    AlreadyTerminal,
}

/// Execute one generation job end-to-end.
#[allow(clippy::too_many_arguments)]
pub async fn process_generation_job(
    pool: &DbPool,
    bus: &ProgressBus,
    recorder: Option<&GenerationEventRecorder>,
    settings: &Settings,
    collaborators: &JobCollaborators,
    job_id: JobId,
    override_params: Option<Map<String, Value>>,
) -> EngineResult<ProcessOutcome> {
    let jobs = JobStore::new(pool.clone());

    info!("Starting generation job {}", job_id);
    let job = jobs.get(job_id).await?;

    // At-least-once delivery: a re-delivered task for a finished job must
    // no-op, never re-submit to the backend.
    if job.status.is_terminal() {
        info!(
            "Job {} already '{}', skipping re-delivered task",
            job_id, job.status
        );
        return Ok(ProcessOutcome::AlreadyTerminal);
    }

    match run_job(
        &jobs, pool, bus, settings, collaborators, &job, override_params,
    )
    .await
    {
        Ok(outcome) => {
            if let (Some(recorder), ProcessOutcome::Completed { .. }) = (recorder, &outcome) {
                let refreshed = jobs.get(job_id).await?;
                let duration_ms = execution_millis(&refreshed);
                recorder.record_completion(
                    &refreshed,
                    true,
                    duration_ms,
                    None,
                    None,
                    queue_wait_millis(&refreshed),
                    duration_ms,
                );
            }
            Ok(outcome)
        }
        Err(exc) => {
            error!("Job {} failed: {}", job_id, exc);
            handle_failure(&jobs, pool, bus, recorder, job_id, &exc).await;
            Err(exc)
        }
    }
}

async fn run_job(
    jobs: &JobStore,
    pool: &DbPool,
    bus: &ProgressBus,
    settings: &Settings,
    collaborators: &JobCollaborators,
    job: &Job,
    override_params: Option<Map<String, Value>>,
) -> EngineResult<ProcessOutcome> {
    let job_id = job.job_id();
    let content = ContentStore::new(pool.clone());
    let notifications = NotificationStore::new(pool.clone());

    // Transition to running and announce it.
    jobs.mark_running(job_id).await?;
    bus.publish_started(job_id);

    // Merge runtime overrides into the stored params.
    let mut job_params = job.params.0.clone();
    if let Some(overrides) = override_params {
        for (key, value) in overrides {
            job_params.insert(key, value);
        }
    }

    let request = build_request(job, &job_params, settings);
    let workflow = collaborators.workflow_builder.build(&request);

    let correlation_id = collaborators
        .backend
        .submit(&workflow, &job_id.to_string())
        .await?;
    jobs.set_correlation_id(job_id, &correlation_id).await?;
    info!("Job {} submitted (correlation_id={})", job_id, correlation_id);
    bus.publish_processing(job_id, None);

    let max_wait = Duration::from_secs(settings.backend_max_wait_secs);
    let workflow_status = collaborators
        .backend
        .wait_for_outputs(&correlation_id, max_wait)
        .await?;

    if workflow_status.status != BackendJobStatus::Completed {
        return Err(EngineError::BackendWorkflow(format!(
            "backend reported status '{}' for job {}: {:?}",
            workflow_status.status, job_id, workflow_status.messages
        )));
    }

    let output_paths = collaborators
        .backend
        .collect_output_paths(&workflow_status.outputs);
    if output_paths.is_empty() {
        return Err(EngineError::BackendWorkflow(format!(
            "No output files produced for job {job_id}"
        )));
    }

    // Primary outputs are organized into the user/date layout; mock outputs
    // are used as-is.
    let organized_paths = match job.backend {
        BackendKind::Primary => collaborators
            .file_service
            .organize(job_id, &job.user_id, &output_paths)
            .map_err(|e| EngineError::internal(e.to_string()))?,
        BackendKind::Mock => output_paths,
    };

    let thumbnails = match collaborators
        .thumbnail_service
        .generate(&organized_paths, job_id)
    {
        Ok(summary) => summary,
        Err(thumb_err) => {
            warn!("Thumbnail generation failed for job {}: {}", job_id, thumb_err);
            Value::Object(Map::new())
        }
    };

    // Final metadata: params plus everything the execution learned.
    let mut metadata = job_params;
    metadata.insert(
        "output_paths".into(),
        serde_json::to_value(&organized_paths).unwrap_or(Value::Null),
    );
    metadata.insert("thumbnails".into(), thumbnails);
    metadata.insert(
        "backend_correlation_id".into(),
        Value::String(correlation_id.clone()),
    );
    metadata.insert(
        "workflow_messages".into(),
        serde_json::to_value(&workflow_status.messages).unwrap_or(Value::Null),
    );
    metadata.insert(
        "backend_results_url".into(),
        workflow_status
            .history_url
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    metadata.insert(
        "backend_results".into(),
        workflow_status.raw_history.clone().unwrap_or(Value::Null),
    );

    let primary_output = organized_paths[0].clone();
    let title = metadata
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| job.prompt.chars().take(CONTENT_TITLE_MAX_CHARS).collect());

    let creator_id = job
        .user_id
        .parse()
        .map_err(|_| EngineError::internal(format!("job {job_id} has malformed user id")))?;
    let content_item = content
        .insert(NewContent {
            creator_id,
            title,
            content_type: "image".to_string(),
            content_data: primary_output,
            prompt: job.prompt.clone(),
            item_metadata: Value::Object(metadata.clone()),
        })
        .await?;

    jobs.mark_completed(job_id, content_item.id, Some(&metadata))
        .await?;
    info!("Job {} completed successfully", job_id);

    bus.publish_completed(job_id, content_item.id, organized_paths.clone());

    if let Err(notif_error) = notifications
        .create_job_completion(&job.user_id, job_id, content_item.id)
        .await
    {
        warn!(
            "Failed to create completion notification for job {}: {}",
            job_id, notif_error
        );
    }

    Ok(ProcessOutcome::Completed {
        content_id: content_item.id,
        output_paths: organized_paths,
    })
}

/// Failure path: persist the failed state, publish, notify. Each step is
/// best-effort so the original error always reaches the queue.
async fn handle_failure(
    jobs: &JobStore,
    pool: &DbPool,
    bus: &ProgressBus,
    recorder: Option<&GenerationEventRecorder>,
    job_id: JobId,
    exc: &EngineError,
) {
    let message = exc.to_string();

    let job = match jobs.get(job_id).await {
        Ok(job) => job,
        Err(load_error) => {
            error!(
                "Failed to reload job {} while persisting failure: {}",
                job_id, load_error
            );
            return;
        }
    };

    // A cancel may have landed while the attempt was in flight; terminal
    // rows are left alone.
    if !job.status.is_terminal() {
        if let Err(update_error) = jobs.mark_failed(job_id, &message).await {
            error!(
                "Failed to persist failure state for job {}: {}",
                job_id, update_error
            );
            return;
        }
    }

    bus.publish_failed(job_id, message.clone());

    let notifications = NotificationStore::new(pool.clone());
    if let Err(notif_error) = notifications
        .create_job_failure(&job.user_id, job_id, &message)
        .await
    {
        warn!(
            "Failed to create failure notification for job {}: {}",
            job_id, notif_error
        );
    }

    if let Some(recorder) = recorder {
        let error_type = match exc {
            EngineError::BackendConnection(_) => "backend_connection",
            EngineError::BackendWorkflow(_) => "backend_workflow",
            EngineError::Timeout(_) => "timeout",
            _ => "internal",
        };
        recorder.record_completion(
            &job,
            false,
            execution_millis(&job),
            Some(error_type),
            Some(&message),
            queue_wait_millis(&job),
            None,
        );
    }
}

/// Rebuild the resolved request from the stored row plus merged params,
/// filling configuration defaults for anything missing.
fn build_request(
    job: &Job,
    params: &Map<String, Value>,
    settings: &Settings,
) -> GenerationRequest {
    let sampler_params = params
        .get("sampler_params")
        .and_then(|v| serde_json::from_value::<SamplerParams>(v.clone()).ok())
        .unwrap_or_else(|| job.sampler_params.0.clone());

    let lora_models = if !job.lora_models.0.is_empty() {
        job.lora_models.0.clone()
    } else {
        params
            .get("lora_models")
            .and_then(|v| serde_json::from_value::<Vec<LoraModel>>(v.clone()).ok())
            .unwrap_or_default()
    };

    GenerationRequest {
        prompt: job.prompt.clone(),
        negative_prompt: job
            .negative_prompt
            .clone()
            .or_else(|| {
                params
                    .get("negative_prompt")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default(),
        checkpoint_model: job
            .checkpoint_model
            .clone()
            .or_else(|| {
                params
                    .get("checkpoint_model")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| settings.default_checkpoint.clone()),
        lora_models,
        width: job
            .width
            .map(|w| w as u32)
            .or_else(|| params.get("width").and_then(Value::as_u64).map(|w| w as u32))
            .unwrap_or(settings.default_width),
        height: job
            .height
            .map(|h| h as u32)
            .or_else(|| params.get("height").and_then(Value::as_u64).map(|h| h as u32))
            .unwrap_or(settings.default_height),
        batch_size: job
            .batch_size
            .map(|b| b as u32)
            .or_else(|| {
                params
                    .get("batch_size")
                    .and_then(Value::as_u64)
                    .map(|b| b as u32)
            })
            .unwrap_or(settings.default_batch_size),
        sampler_params,
        filename_prefix: format!("gen_job_{}", job.id),
    }
}

fn execution_millis(job: &Job) -> Option<i64> {
    match (job.started_at, job.completed_at) {
        (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
        (Some(started), None) => Some((Utc::now() - started).num_milliseconds()),
        _ => None,
    }
}

fn queue_wait_millis(job: &Job) -> Option<i64> {
    job.started_at
        .map(|started| (started - job.created_at).num_milliseconds())
}

/// Production collaborator wiring for one claimed job.
pub fn default_collaborators(job: &Job, settings: &Settings) -> JobCollaborators {
    JobCollaborators::for_backend(job.backend, settings)
}

/// Convenience used by the worker: look the job up first so the bundle
/// matches its backend selector.
pub async fn collaborators_for(
    pool: &DbPool,
    job_id: JobId,
    settings: &Settings,
) -> EngineResult<JobCollaborators> {
    let job = JobStore::new(pool.clone()).get(job_id).await?;
    Ok(default_collaborators(&job, settings))
}
