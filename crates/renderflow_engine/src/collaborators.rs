//! Injectable collaborators for the worker-side runner.
//!
//! The engine owns a short-lived bundle of these per job execution; tests
//! swap any of them. File organization and thumbnailing are plain blocking
//! I/O, as cheap as the worker's other filesystem work.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use renderflow_protocol::{BackendKind, JobId, Settings};

use crate::backend::BackendClient;
use crate::workflow::WorkflowBuilder;

/// Relocates finished outputs into the library layout.
pub trait FileService: Send + Sync {
    /// Move `paths` into the per-user layout, returning the new locations.
    fn organize(&self, job_id: JobId, user_id: &str, paths: &[String]) -> Result<Vec<String>>;
}

/// Moves outputs under `<root>/<user_id>/<YYYY>/<MM>/<DD>/`.
pub struct LocalFileService {
    root: PathBuf,
}

impl LocalFileService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileService for LocalFileService {
    fn organize(&self, job_id: JobId, user_id: &str, paths: &[String]) -> Result<Vec<String>> {
        let today = Utc::now();
        let target_dir = self
            .root
            .join(user_id)
            .join(today.format("%Y/%m/%d").to_string());
        std::fs::create_dir_all(&target_dir)
            .with_context(|| format!("Failed to create {}", target_dir.display()))?;

        let mut organized = Vec::with_capacity(paths.len());
        for path in paths {
            let source = Path::new(path);
            let file_name = source
                .file_name()
                .with_context(|| format!("Output path has no file name: {path}"))?;
            let target = target_dir.join(file_name);
            std::fs::rename(source, &target)
                .or_else(|_| {
                    // Cross-device moves fall back to copy + remove.
                    std::fs::copy(source, &target)
                        .and_then(|_| std::fs::remove_file(source))
                        .map(|_| ())
                })
                .with_context(|| format!("Failed to move {path} to {}", target.display()))?;
            organized.push(target.to_string_lossy().into_owned());
        }

        info!("Organized {} outputs for job {}", organized.len(), job_id);
        Ok(organized)
    }
}

/// Leaves paths untouched (mock backend outputs are already placed).
pub struct PassthroughFileService;

impl FileService for PassthroughFileService {
    fn organize(&self, _job_id: JobId, _user_id: &str, paths: &[String]) -> Result<Vec<String>> {
        Ok(paths.to_vec())
    }
}

/// Produces the thumbnail manifest for finished outputs. Rasterization
/// itself lives outside the core; failures never fail the job.
pub trait ThumbnailService: Send + Sync {
    fn generate(&self, paths: &[String], job_id: JobId) -> Result<Value>;
}

/// No-op manifest.
pub struct NoopThumbnailService;

impl ThumbnailService for NoopThumbnailService {
    fn generate(&self, _paths: &[String], _job_id: JobId) -> Result<Value> {
        Ok(json!({}))
    }
}

/// The bundle of collaborators one job execution runs against.
pub struct JobCollaborators {
    pub backend: BackendClient,
    pub workflow_builder: WorkflowBuilder,
    pub file_service: Box<dyn FileService>,
    pub thumbnail_service: Box<dyn ThumbnailService>,
}

impl JobCollaborators {
    /// Production wiring for a job's backend selector.
    pub fn for_backend(kind: BackendKind, settings: &Settings) -> Self {
        let file_service: Box<dyn FileService> = match kind {
            BackendKind::Primary => Box::new(LocalFileService::new(&settings.output_dir)),
            BackendKind::Mock => Box::new(PassthroughFileService),
        };
        Self {
            backend: BackendClient::for_backend(kind, settings),
            workflow_builder: WorkflowBuilder::new(),
            file_service,
            thumbnail_service: Box::new(NoopThumbnailService),
        }
    }
}
