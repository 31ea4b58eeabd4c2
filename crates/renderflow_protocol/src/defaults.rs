//! Canonical default values shared across the control and worker planes.

pub const DEFAULT_NAMESPACE: &str = "renderflow_dev";
pub const DEFAULT_DATABASE_URL: &str = "sqlite:renderflow.db?mode=rwc";
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8188";
pub const DEFAULT_MOCK_BACKEND_URL: &str = "http://localhost:8189";
pub const DEFAULT_CHECKPOINT: &str = "illustriousXL_v01.safetensors";
pub const DEFAULT_WIDTH: u32 = 832;
pub const DEFAULT_HEIGHT: u32 = 1216;
pub const DEFAULT_BATCH_SIZE: u32 = 1;
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_BACKEND_POLL_INTERVAL_SECS: f64 = 2.0;
pub const DEFAULT_BACKEND_MAX_WAIT_SECS: u64 = 900;
pub const MAX_PROMPT_CHARS: usize = 10_000;
pub const CONTENT_TITLE_MAX_CHARS: usize = 255;
pub const NOTIFICATION_ERROR_MAX_CHARS: usize = 500;
pub const CANCELLED_PREFIX: &str = "Cancelled: ";
pub const EVENT_BUFFER_MAX_LEN: usize = 100_000;
pub const TRANSFER_BATCH_SIZE: usize = 1_000;
