//! Database layer for Renderflow.
//!
//! SQLite via sqlx: a single transactional store shared by the API
//! processes, the workers and the scheduler. Timestamps are stored as
//! RFC 3339 text; params and metadata columns hold JSON.

pub mod content;
pub mod error;
pub mod jobs;
pub mod models;
pub mod notifications;
pub mod pool;
pub mod schema;
pub mod users;

pub use content::ContentStore;
pub use error::{DbError, Result};
pub use jobs::{JobStore, QueueTotals};
pub use models::{Content, Job, NewContent, NewJob, Notification, User};
pub use notifications::NotificationStore;
pub use pool::{create_pool, DbConfig, DbPool};
pub use schema::ensure_schema;
pub use users::UserStore;
