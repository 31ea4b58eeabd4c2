//! Shared protocol types for Renderflow.
//!
//! Everything that crosses a crate boundary lives here: canonical ids and
//! status enums, generation request payloads, progress-update message
//! shapes, the error taxonomy, topic naming, defaults and the layered
//! configuration snapshot.

pub mod config;
pub mod defaults;
pub mod error;
pub mod naming;
pub mod types;

pub use config::{get_settings, Settings};
pub use error::EngineError;
pub use types::{
    BackendKind, ErrorCategory, GenerationEventKind, GenerationRequest, JobId, JobKind, JobStatus,
    LoraModel, ProgressUpdate, SamplerParams, TaskStatus,
};
