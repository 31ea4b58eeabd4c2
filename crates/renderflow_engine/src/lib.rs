//! Job Lifecycle Engine.
//!
//! Orchestrates one generation job end-to-end: validate -> dispatch -> poll
//! -> collect -> finalize. The worker-side runner executes against an
//! injectable bundle of collaborators (backend client, workflow builder,
//! file and thumbnail services) so tests can swap any seam.

pub mod backend;
pub mod collaborators;
pub mod runner;
pub mod service;
pub mod telemetry;
pub mod workflow;

pub use backend::{BackendClient, BackendJobStatus, HttpBackendClient, MockBackendClient, MockOutcome, WorkflowStatus};
pub use collaborators::{FileService, JobCollaborators, LocalFileService, NoopThumbnailService, PassthroughFileService, ThumbnailService};
pub use runner::{process_generation_job, ProcessOutcome};
pub use service::{CreateJobRequest, GenerationService};
pub use telemetry::GenerationEventRecorder;
pub use workflow::WorkflowBuilder;
