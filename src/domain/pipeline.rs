//! Registered pipelines.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::PipelineType;

/// Stable identity of a registered pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(pub u64);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A compiled pipeline binary that speaks the plugin protocol.
///
/// Pipelines are created by discovery (or registered explicitly) and are
/// read-only to the scheduler. Re-registering the same `id` replaces the
/// definition, which is how changed binaries are picked up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    pub exec_path: PathBuf,
    #[serde(default)]
    pub pipeline_type: PipelineType,
    /// Whether more than one run of this pipeline may be active at a time.
    #[serde(default = "default_concurrent")]
    pub concurrent: bool,
    /// Queue priority; higher values are dequeued first.
    #[serde(default)]
    pub priority: i32,
    /// blake3 hex digest of the binary at registration time.
    #[serde(default)]
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

fn default_concurrent() -> bool {
    true
}

impl Pipeline {
    pub fn new(id: PipelineId, name: impl Into<String>, exec_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            exec_path: exec_path.into(),
            pipeline_type: PipelineType::default(),
            concurrent: default_concurrent(),
            priority: 0,
            checksum: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_type(mut self, pipeline_type: PipelineType) -> Self {
        self.pipeline_type = pipeline_type;
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = checksum.into();
        self
    }
}
