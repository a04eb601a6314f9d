// src/engine/mod.rs

//! Run orchestration.
//!
//! This module ties together:
//! - the [`Scheduler`], which accepts run requests, enforces per-pipeline
//!   concurrency and owns the run state machine up to enqueue time
//! - the [`RunQueue`] every worker pulls from
//! - the worker pool, where each slot takes a run, talks to its plugin and
//!   drives the job plan to a terminal status
//!
//! After a run is queued, only the worker holding it writes its record
//! (or the scheduler, while the entry is still undispatched).

mod executor;
pub mod queue;
pub mod scheduler;
mod worker;

pub use queue::{QueuedRun, RunQueue};
pub use scheduler::{Scheduler, SchedulerOptions};
