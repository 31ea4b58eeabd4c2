//! Task queue and worker-health layer.
//!
//! Work distribution is DB-claim based: enqueue inserts a `queued` row with a
//! dispatch token, workers claim atomically via `UPDATE ... WHERE status`,
//! and the retry policy re-queues retryable failures with exponential
//! backoff. Delivery is at-least-once; handlers own their idempotency.

pub mod cancel;
pub mod health;
pub mod queue;
pub mod scheduler;
pub mod tasks;

pub use cancel::CancelRegistry;
pub use health::{record_heartbeat, HeartbeatProbe, WorkerHealthProbe};
pub use queue::{TaskOutcome, TaskQueue, TaskQueueStats, TaskSpec, WorkerTask};
pub use scheduler::{PeriodicEntry, PeriodicSet};
