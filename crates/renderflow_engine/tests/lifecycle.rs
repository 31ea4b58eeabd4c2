//! End-to-end lifecycle scenarios across the engine, queue and bus.

use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use renderflow_db::{DbPool, UserStore};
use renderflow_engine::{
    process_generation_job, BackendClient, BackendJobStatus, CreateJobRequest, GenerationService,
    JobCollaborators, MockBackendClient, MockOutcome, NoopThumbnailService, PassthroughFileService,
    ProcessOutcome, WorkflowBuilder,
};
use renderflow_events::ProgressBus;
use renderflow_protocol::{
    BackendKind, EngineError, JobKind, JobStatus, SamplerParams, Settings, TaskStatus,
};
use renderflow_queue::{tasks, TaskOutcome, TaskQueue, WorkerHealthProbe};
use renderflow_test_utils::{seed_user, test_pool, test_settings};

struct World {
    pool: DbPool,
    queue: Arc<TaskQueue>,
    bus: ProgressBus,
    settings: Settings,
    user_id: Uuid,
}

async fn world() -> (World, GenerationService) {
    let pool = test_pool().await;
    let user_id = seed_user(&pool).await;
    let settings = test_settings();
    let queue = Arc::new(TaskQueue::new(pool.clone()));
    let service = GenerationService::new(
        pool.clone(),
        queue.clone(),
        WorkerHealthProbe::stub(true),
        settings.clone(),
    );
    (
        World {
            pool,
            queue,
            bus: ProgressBus::new(&settings.namespace),
            settings,
            user_id,
        },
        service,
    )
}

fn submission(user_id: Uuid, prompt: &str) -> CreateJobRequest {
    CreateJobRequest {
        user_id,
        job_type: JobKind::Image,
        prompt: prompt.to_string(),
        width: Some(832),
        height: Some(1216),
        batch_size: Some(1),
        backend: Some(BackendKind::Mock),
        ..Default::default()
    }
}

fn collaborators(outcomes: Vec<MockOutcome>) -> JobCollaborators {
    JobCollaborators {
        backend: BackendClient::Mock(MockBackendClient::with_outcomes("/tmp/mock", outcomes)),
        workflow_builder: WorkflowBuilder::new(),
        file_service: Box::new(PassthroughFileService),
        thumbnail_service: Box::new(NoopThumbnailService),
    }
}

// ----------------------------------------------------------------------
// Submission round-trip and defaults
// ----------------------------------------------------------------------

#[tokio::test]
async fn create_echoes_params_and_fills_defaults() {
    let (world, service) = world().await;

    let job = service
        .create(CreateJobRequest {
            user_id: world.user_id,
            job_type: JobKind::Image,
            prompt: "  sunrise  ".to_string(),
            backend: Some(BackendKind::Mock),
            ..Default::default()
        })
        .await
        .unwrap();

    // Defaults filled from configuration; prompt trimmed; sampler defaults.
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.prompt, "sunrise");
    assert_eq!(job.width, Some(world.settings.default_width as i64));
    assert_eq!(job.height, Some(world.settings.default_height as i64));
    assert_eq!(job.batch_size, Some(world.settings.default_batch_size as i64));
    assert_eq!(
        job.checkpoint_model.as_deref(),
        Some(world.settings.default_checkpoint.as_str())
    );
    assert_eq!(job.sampler_params.0, SamplerParams::default());
    assert_eq!(job.backend, BackendKind::Mock);
    assert_eq!(job.params.0["backend"], "mock");
    assert!(job.dispatch_token.is_some());

    // A run_generation_job task is on the generation queue.
    let task = world
        .queue
        .claim(&[tasks::GENERATION_QUEUE], "w1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.task_name, tasks::RUN_GENERATION_JOB);
    assert_eq!(task.args.0["job_id"], job.id);

    // Fetch echoes the stored row.
    let fetched = service.get_job(job.job_id()).await.unwrap();
    assert_eq!(fetched.prompt, "sunrise");
}

#[tokio::test]
async fn prompt_boundaries() {
    let (world, service) = world().await;

    let err = service
        .create(submission(world.user_id, ""))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let at_limit = "p".repeat(10_000);
    assert!(service
        .create(submission(world.user_id, &at_limit))
        .await
        .is_ok());

    let over_limit = "p".repeat(10_001);
    let err = service
        .create(submission(world.user_id, &over_limit))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn missing_user_is_not_found() {
    let (_world, service) = world().await;
    let err = service
        .create(submission(Uuid::new_v4(), "sunrise"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

// ----------------------------------------------------------------------
// Scenario: workers offline rejection
// ----------------------------------------------------------------------

#[tokio::test]
async fn submission_rejected_when_no_workers() {
    let pool = test_pool().await;
    let user_id = seed_user(&pool).await;
    let settings = test_settings();
    let queue = Arc::new(TaskQueue::new(pool.clone()));
    let service = GenerationService::new(
        pool.clone(),
        queue.clone(),
        WorkerHealthProbe::stub(false),
        settings,
    );

    let err = service
        .create(submission(user_id, "sunrise"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WorkersUnavailable));

    // No row inserted, nothing queued.
    let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM generation_jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(jobs, 0);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.queued, 0);
}

// ----------------------------------------------------------------------
// Scenario: cancellation mid-run
// ----------------------------------------------------------------------

#[tokio::test]
async fn cancel_running_job_revokes_and_prefixes_reason() {
    let (world, service) = world().await;
    let job = service
        .create(submission(world.user_id, "sunrise"))
        .await
        .unwrap();

    // Worker picked the task up; job is running.
    let task = world
        .queue
        .claim(&[tasks::GENERATION_QUEUE], "w1")
        .await
        .unwrap()
        .unwrap();
    service.start(job.job_id()).await.unwrap();
    let registry = world.queue.cancel_registry();
    let cancel_token = registry.register(&task.dispatch_token);

    let mut sub = world.bus.subscribe_job(job.job_id());
    let cancelled = service
        .cancel(job.job_id(), Some("user changed mind"))
        .await
        .unwrap();

    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(
        cancelled.error_message.as_deref(),
        Some("Cancelled: user changed mind")
    );
    assert!(cancelled.content_id.is_none());
    // Terminate signal reached the executing task.
    assert!(cancel_token.is_cancelled());
    // No completion was ever published.
    assert!(sub.try_recv().is_none());

    // Cancelling again is a validation error.
    let err = service.cancel(job.job_id(), None).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn cancel_before_dispatch_revokes_queued_task() {
    let (world, service) = world().await;
    let job = service
        .create(submission(world.user_id, "sunrise"))
        .await
        .unwrap();

    service.cancel(job.job_id(), None).await.unwrap();

    let token = service
        .get_job(job.job_id())
        .await
        .unwrap()
        .dispatch_token
        .unwrap();
    let task = world.queue.get_by_token(&token).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Revoked);
}

// ----------------------------------------------------------------------
// Scenario: backend failure with retries to terminal failure
// ----------------------------------------------------------------------

#[tokio::test]
async fn backend_failure_retries_then_fails_terminally() {
    let (world, service) = world().await;
    let job = service
        .create(submission(world.user_id, "sunrise"))
        .await
        .unwrap();

    let failing = || {
        collaborators(vec![MockOutcome::Finish {
            status: BackendJobStatus::Failed,
            messages: vec!["GPU OOM".to_string()],
        }])
    };

    let mut outcomes = Vec::new();
    for attempt in 0..4 {
        // Clear the backoff gate so the retry is immediately claimable.
        sqlx::query("UPDATE worker_tasks SET not_before = ?")
            .bind(chrono::Utc::now() - chrono::Duration::minutes(1))
            .execute(&world.pool)
            .await
            .unwrap();
        let task = world
            .queue
            .claim(&[tasks::GENERATION_QUEUE], "w1")
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("attempt {attempt}: expected a claimable task"));

        // Re-arm the job for the retry (the failure path left it failed).
        if attempt > 0 {
            sqlx::query("UPDATE generation_jobs SET status = 'pending', error_message = NULL WHERE id = ?")
                .bind(job.id)
                .execute(&world.pool)
                .await
                .unwrap();
        }

        let err = process_generation_job(
            &world.pool,
            &world.bus,
            None,
            &world.settings,
            &failing(),
            job.job_id(),
            None,
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());

        let outcome = world
            .queue
            .fail(task.id, &err.to_string(), err.is_retryable())
            .await
            .unwrap();
        outcomes.push(outcome);
    }

    // Three retries, then terminal failure.
    assert!(matches!(outcomes[0], TaskOutcome::Retried { .. }));
    assert!(matches!(outcomes[1], TaskOutcome::Retried { .. }));
    assert!(matches!(outcomes[2], TaskOutcome::Retried { .. }));
    assert_eq!(outcomes[3], TaskOutcome::Failed);

    let final_job = service.get_job(job.job_id()).await.unwrap();
    assert_eq!(final_job.status, JobStatus::Failed);
    assert!(final_job
        .error_message
        .as_deref()
        .unwrap()
        .contains("GPU OOM"));
    assert!(final_job.content_id.is_none());
}

// ----------------------------------------------------------------------
// Finalization API idempotence and boundaries
// ----------------------------------------------------------------------

#[tokio::test]
async fn finalization_api_enforces_state_machine() {
    let (world, service) = world().await;
    let job = service
        .create(submission(world.user_id, "sunrise"))
        .await
        .unwrap();

    // complete() requires running and an existing content row.
    let err = service.complete(job.job_id(), 999).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    service.start(job.job_id()).await.unwrap();
    let err = service.start(job.job_id()).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    service.fail(job.job_id(), "backend exploded").await.unwrap();
    // fail() on a failed job conflicts.
    let err = service.fail(job.job_id(), "again").await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    // Terminal rows can be deleted, live ones cannot.
    let live = service
        .create(submission(world.user_id, "second"))
        .await
        .unwrap();
    let err = service.delete_job(live.job_id()).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    service.delete_job(job.job_id()).await.unwrap();
}

#[tokio::test]
async fn complete_links_content() {
    let (world, service) = world().await;
    let job = service
        .create(submission(world.user_id, "sunrise"))
        .await
        .unwrap();

    let outcome = process_generation_job(
        &world.pool,
        &world.bus,
        None,
        &world.settings,
        &collaborators(vec![MockOutcome::Complete {
            paths: vec!["/mock/out/a.png".to_string()],
        }]),
        job.job_id(),
        None,
    )
    .await
    .unwrap();

    let ProcessOutcome::Completed { content_id, output_paths } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(output_paths, vec!["/mock/out/a.png".to_string()]);

    let done = service.get_job(job.job_id()).await.unwrap();
    assert_eq!(done.content_id, Some(content_id));
    assert!(done.started_at.unwrap() <= done.completed_at.unwrap());
}

#[tokio::test]
async fn update_job_params_only_while_pending() {
    let (world, service) = world().await;
    let job = service
        .create(submission(world.user_id, "sunrise"))
        .await
        .unwrap();

    let mut params = Map::new();
    params.insert("style".to_string(), Value::String("oil".to_string()));
    let updated = service.update_job(job.job_id(), params.clone()).await.unwrap();
    assert_eq!(updated.params.0["style"], "oil");

    service.start(job.job_id()).await.unwrap();
    let err = service.update_job(job.job_id(), params).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn queue_statistics_track_counts() {
    let (world, service) = world().await;
    let a = service.create(submission(world.user_id, "a")).await.unwrap();
    let _b = service.create(submission(world.user_id, "b")).await.unwrap();
    service.start(a.job_id()).await.unwrap();

    let stats = service.queue_statistics().await.unwrap();
    assert_eq!(stats.pending_jobs, 1);
    assert_eq!(stats.running_jobs, 1);
    assert_eq!(stats.total_jobs, 2);
}

#[tokio::test]
async fn inactive_user_cannot_submit() {
    let (world, service) = world().await;
    UserStore::new(world.pool.clone())
        .set_active(world.user_id, false)
        .await
        .unwrap();

    let err = service
        .create(submission(world.user_id, "sunrise"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn user_job_listing_filters_by_status() {
    let (world, service) = world().await;
    let a = service.create(submission(world.user_id, "a")).await.unwrap();
    let _b = service.create(submission(world.user_id, "b")).await.unwrap();
    service.cancel(a.job_id(), None).await.unwrap();

    let cancelled = service
        .get_user_jobs(world.user_id, Some(JobStatus::Cancelled), 10, 0)
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, a.id);

    let all = service
        .get_user_jobs(world.user_id, None, 10, 0)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}
