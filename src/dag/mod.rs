// src/dag/mod.rs

//! Job dependency graph and per-run job planning.
//!
//! - [`graph`] validates the jobs a plugin declares and keeps adjacency
//!   information (direct dependencies).
//! - [`plan`] contains the per-run state machine that decides which job
//!   runs next and which are skipped.

pub mod graph;
pub mod plan;

pub use graph::JobGraph;
pub use plan::{JobPlan, JobState, PlanStep};
