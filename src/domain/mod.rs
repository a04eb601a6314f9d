// src/domain/mod.rs

//! Core data model: pipelines, runs, and the jobs a pipeline declares.

pub mod job;
pub mod pipeline;
pub mod run;

pub use job::{JobDescriptor, JobOutcome};
pub use pipeline::{Pipeline, PipelineId};
pub use run::{JobRecord, JobStatus, PipelineRun, RunId, RunStatus};
