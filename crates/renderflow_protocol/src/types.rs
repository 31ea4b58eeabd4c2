//! Canonical payload types shared across all crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Canonical ids
// ============================================================================

/// Canonical generation-job identifier across the system.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = JobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<i64>()
            .map_err(|_| JobIdError::Parse(s.to_string()))?;
        if value < 0 {
            return Err(JobIdError::Negative(value));
        }
        Ok(JobId::new(value))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobIdError {
    #[error("job id cannot be negative: {0}")]
    Negative(i64),
    #[error("invalid job id: {0}")]
    Parse(String),
}

// ============================================================================
// Job lifecycle status
// ============================================================================

/// Generation-job status, the lifecycle of a job from submission onwards.
/// This is the CANONICAL definition; the database stores the lowercase form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created and queued, not yet picked up by a worker
    #[default]
    Pending,
    /// A worker is executing the job
    Running,
    /// Outputs collected, content persisted
    Completed,
    /// Unrecoverable error or retry budget exhausted
    Failed,
    /// Explicitly cancelled before completion
    Cancelled,
}

impl JobStatus {
    pub const ALL: &'static [JobStatus] = &[
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Whether the state machine permits `self -> next`.
    ///
    /// Terminal states have no outgoing transitions; everything else follows
    /// the submission/execution/cancellation paths.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Pending, JobStatus::Cancelled) => true,
            (JobStatus::Pending, JobStatus::Failed) => true,
            (JobStatus::Running, JobStatus::Completed) => true,
            (JobStatus::Running, JobStatus::Failed) => true,
            (JobStatus::Running, JobStatus::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Invalid job status: '{}'", s)),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Worker-task status (queue rows, distinct from JobStatus)
// ============================================================================

/// Status of a queued worker task. Jobs and tasks have separate lifecycles:
/// a revoked task leaves its job to the cancel RPC, a failed task may be
/// retried while the job stays `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Revoked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Revoked => "revoked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Revoked
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "revoked" => Ok(TaskStatus::Revoked),
            _ => Err(format!("Invalid task status: '{}'", s)),
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Job kind & backend selector
// ============================================================================

/// Kind of generation work. Only `image` is fully supported today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    #[default]
    Image,
    Video,
    Text,
}

impl JobKind {
    pub const ALL: &'static [JobKind] = &[JobKind::Image, JobKind::Video, JobKind::Text];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Image => "image",
            JobKind::Video => "video",
            JobKind::Text => "text",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "image" => Ok(JobKind::Image),
            "video" => Ok(JobKind::Video),
            "text" => Ok(JobKind::Text),
            _ => Err(format!(
                "Invalid job type: '{}'. Expected: image, video, or text",
                s
            )),
        }
    }
}

impl TryFrom<String> for JobKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Which rendering backend a job is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The real rendering backend
    #[default]
    Primary,
    /// The mock backend used by tests and local development
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Primary => "primary",
            BackendKind::Mock => "mock",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(BackendKind::Primary),
            "mock" => Ok(BackendKind::Mock),
            _ => Err(format!(
                "Invalid backend: '{}'. Expected: primary or mock",
                s
            )),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Generation request payloads
// ============================================================================

/// Sampler configuration forwarded to the rendering backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerParams {
    pub seed: i64,
    pub steps: u32,
    pub cfg: f64,
    pub sampler_name: String,
    pub scheduler: String,
    pub denoise: f64,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            seed: 0,
            steps: 20,
            cfg: 7.0,
            sampler_name: "euler".to_string(),
            scheduler: "normal".to_string(),
            denoise: 1.0,
        }
    }
}

/// A LoRA adjunct applied on top of the checkpoint model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraModel {
    pub name: String,
    #[serde(default = "default_lora_strength")]
    pub strength_model: f64,
    #[serde(default = "default_lora_strength")]
    pub strength_clip: f64,
}

fn default_lora_strength() -> f64 {
    0.8
}

/// Fully-resolved request handed to the workflow builder and backend client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub checkpoint_model: String,
    #[serde(default)]
    pub lora_models: Vec<LoraModel>,
    pub width: u32,
    pub height: u32,
    pub batch_size: u32,
    #[serde(default)]
    pub sampler_params: SamplerParams,
    pub filename_prefix: String,
}

// ============================================================================
// Progress updates (bus messages)
// ============================================================================

/// A per-job status message published on the Progress Bus and relayed to
/// connected clients verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressUpdate {
    fn new(job_id: JobId, status: JobStatus) -> Self {
        Self {
            job_id,
            status,
            timestamp: Utc::now(),
            progress: None,
            content_id: None,
            output_paths: None,
            error: None,
        }
    }

    pub fn started(job_id: JobId) -> Self {
        Self::new(job_id, JobStatus::Running)
    }

    pub fn processing(job_id: JobId, progress: Option<f64>) -> Self {
        let mut update = Self::new(job_id, JobStatus::Running);
        update.progress = progress;
        update
    }

    pub fn completed(job_id: JobId, content_id: i64, output_paths: Vec<String>) -> Self {
        let mut update = Self::new(job_id, JobStatus::Completed);
        update.content_id = Some(content_id);
        update.output_paths = Some(output_paths);
        update
    }

    pub fn failed(job_id: JobId, error: impl Into<String>) -> Self {
        let mut update = Self::new(job_id, JobStatus::Failed);
        update.error = Some(error.into());
        update
    }

    /// Wire phase name: the relay protocol distinguishes `started` from
    /// `processing` while both map to the `running` job status.
    pub fn phase(&self) -> &'static str {
        match self.status {
            JobStatus::Running if self.progress.is_some() => "processing",
            JobStatus::Running => "started",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Pending => "pending",
        }
    }
}

// ============================================================================
// Analytics enums
// ============================================================================

/// Kind of a generation telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationEventKind {
    Request,
    Completion,
    Cancellation,
}

impl GenerationEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationEventKind::Request => "request",
            GenerationEventKind::Completion => "completion",
            GenerationEventKind::Cancellation => "cancellation",
        }
    }
}

impl fmt::Display for GenerationEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GenerationEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "request" => Ok(GenerationEventKind::Request),
            "completion" => Ok(GenerationEventKind::Completion),
            "cancellation" => Ok(GenerationEventKind::Cancellation),
            _ => Err(format!("Invalid generation event kind: '{}'", s)),
        }
    }
}

/// Error category derived from an HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ClientError,
    ServerError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
        }
    }

    /// Categorize a status code: 5xx -> server_error, 4xx -> client_error,
    /// anything else -> None.
    pub fn from_status(status: u16) -> Option<Self> {
        if status >= 500 {
            Some(ErrorCategory::ServerError)
        } else if status >= 400 {
            Some(ErrorCategory::ClientError)
        } else {
            None
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "client_error" => Ok(ErrorCategory::ClientError),
            "server_error" => Ok(ErrorCategory::ServerError),
            _ => Err(format!("Invalid error category: '{}'", s)),
        }
    }
}
