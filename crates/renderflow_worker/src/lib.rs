//! Worker runtime.
//!
//! A long-running process that claims tasks off the queue, dispatches them
//! to handlers, enforces time limits, heartbeats, and recycles itself after
//! a bounded number of executions. The periodic scheduler runs as a sibling
//! task in the same process.

pub mod handlers;
pub mod worker;

pub use worker::{run_scheduler, Worker, WorkerConfig, WorkerContext, WorkerExit};
