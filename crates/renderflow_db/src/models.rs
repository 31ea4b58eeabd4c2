//! Database models.
//!
//! Uses derive macros for FromRow to map database rows to structs. Enum
//! columns are stored as lowercase text and converted through the canonical
//! protocol enums; JSON columns decode through `sqlx::types::Json`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use renderflow_protocol::{BackendKind, JobId, JobKind, JobStatus, LoraModel, SamplerParams};

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub is_active: bool,
    pub preferences: Json<Value>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Generation jobs
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Job {
    pub id: i64,
    pub user_id: String,
    #[sqlx(try_from = "String")]
    pub job_type: JobKind,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub checkpoint_model: Option<String>,
    pub lora_models: Json<Vec<LoraModel>>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub batch_size: Option<i64>,
    pub sampler_params: Json<SamplerParams>,
    pub params: Json<Map<String, Value>>,
    #[sqlx(try_from = "String")]
    pub backend: BackendKind,
    pub backend_correlation_id: Option<String>,
    pub dispatch_token: Option<String>,
    pub error_message: Option<String>,
    pub content_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn job_id(&self) -> JobId {
        JobId::new(self.id)
    }
}

/// Fields for a new job row; status starts `pending`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: Uuid,
    pub job_type: JobKind,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub checkpoint_model: Option<String>,
    pub lora_models: Vec<LoraModel>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub batch_size: Option<u32>,
    pub sampler_params: SamplerParams,
    pub params: Map<String, Value>,
    pub backend: BackendKind,
}

// ============================================================================
// Content
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Content {
    pub id: i64,
    pub creator_id: String,
    pub title: String,
    pub content_type: String,
    pub content_data: String,
    pub prompt: String,
    pub item_metadata: Json<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewContent {
    pub creator_id: Uuid,
    pub title: String,
    pub content_type: String,
    pub content_data: String,
    pub prompt: String,
    pub item_metadata: Value,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Notification {
    pub id: i64,
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub kind: String,
    pub job_id: Option<i64>,
    pub content_id: Option<i64>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}
