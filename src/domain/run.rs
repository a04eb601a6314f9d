//! Pipeline runs and their status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::pipeline::{Pipeline, PipelineId};
use crate::errors::{ConveyorError, Result};

/// Per-pipeline run number, allocated by the store.
pub type RunId = u64;

/// Lifecycle of a [`PipelineRun`].
///
/// ```text
/// NotScheduled -> Scheduled -> Running -> Success | Failed
///       \             \  \         \
///        +-> Canceled  +--+-> Failed/Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotScheduled,
    Scheduled,
    Running,
    Success,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Canceled
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;

        matches!(
            (self, next),
            (NotScheduled, Scheduled)
                | (NotScheduled, Canceled)
                | (Scheduled, Running)
                | (Scheduled, Failed)
                | (Scheduled, Canceled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }
}

/// Result of one job within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub name: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn skipped(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: JobStatus::Skipped,
            message: Some(message.into()),
            started_at: None,
            finished_at: None,
        }
    }
}

/// One execution instance of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline_id: PipelineId,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Job results in execution order.
    #[serde(default)]
    pub jobs: Vec<JobRecord>,
    /// Fatal error that ended the run, if any.
    #[serde(default)]
    pub error: Option<String>,
}

impl PipelineRun {
    pub fn new(pipeline: &Pipeline, id: RunId) -> Self {
        Self {
            id,
            pipeline_id: pipeline.id,
            pipeline_name: pipeline.name.clone(),
            status: RunStatus::NotScheduled,
            scheduled_at: Utc::now(),
            started_at: None,
            finished_at: None,
            jobs: Vec::new(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, stamping start/finish times.
    ///
    /// Fails with [`ConveyorError::InvalidTransition`] for any edge that is
    /// not part of the state machine, which includes every transition out
    /// of a terminal state.
    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ConveyorError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Terminal transition that also records the error which caused it.
    pub fn finish_with_error(&mut self, next: RunStatus, error: impl Into<String>) -> Result<()> {
        self.transition(next)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn record_job(&mut self, record: JobRecord) {
        self.jobs.push(record);
    }

    pub fn job(&self, name: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.name == name)
    }
}
