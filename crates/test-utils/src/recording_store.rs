use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use conveyor::domain::{Pipeline, PipelineId, PipelineRun, RunId, RunStatus};
use conveyor::errors::{ConveyorError, Result};
use conveyor::store::{MemoryStore, Store};

/// `MemoryStore` that remembers every status each run was saved with and can
/// be told to fail upcoming `save_run` calls.
#[derive(Debug, Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    history: Mutex<HashMap<(PipelineId, RunId), Vec<RunStatus>>>,
    failing_saves: AtomicU32,
    /// `save_run` calls to let through before `failing_saves` applies.
    passing_saves: AtomicU32,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses `run` was saved with, consecutive duplicates collapsed.
    pub fn history(&self, pipeline: PipelineId, run: RunId) -> Vec<RunStatus> {
        self.history
            .lock()
            .unwrap()
            .get(&(pipeline, run))
            .cloned()
            .unwrap_or_default()
    }

    /// Make the next `n` calls to `save_run` fail.
    pub fn fail_next_saves(&self, n: u32) {
        self.passing_saves.store(0, Ordering::SeqCst);
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Make only the `nth` upcoming call to `save_run` fail (1-based).
    pub fn fail_nth_save(&self, nth: u32) {
        self.passing_saves.store(nth.saturating_sub(1), Ordering::SeqCst);
        self.failing_saves.store(1, Ordering::SeqCst);
    }
}

impl Store for RecordingStore {
    fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        self.inner.save_pipeline(pipeline)
    }

    fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        self.inner.get_pipeline(id)
    }

    fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        self.inner.list_pipelines()
    }

    fn delete_pipeline(&self, id: PipelineId) -> Result<()> {
        self.inner.delete_pipeline(id)
    }

    fn next_pipeline_id(&self) -> Result<PipelineId> {
        self.inner.next_pipeline_id()
    }

    fn save_run(&self, run: &PipelineRun) -> Result<()> {
        let passing = self
            .passing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let failing = !passing
            && self
                .failing_saves
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if failing {
            return Err(ConveyorError::IoError(std::io::Error::other(
                "injected write failure",
            )));
        }

        self.inner.save_run(run)?;
        let mut history = self.history.lock().unwrap();
        let statuses = history.entry((run.pipeline_id, run.id)).or_default();
        if statuses.last() != Some(&run.status) {
            statuses.push(run.status);
        }
        Ok(())
    }

    fn get_run(&self, pipeline: PipelineId, run: RunId) -> Result<Option<PipelineRun>> {
        self.inner.get_run(pipeline, run)
    }

    fn list_runs(&self, pipeline: PipelineId) -> Result<Vec<PipelineRun>> {
        self.inner.list_runs(pipeline)
    }

    fn next_run_id(&self, pipeline: PipelineId) -> Result<RunId> {
        self.inner.next_run_id(pipeline)
    }

    fn append_log(&self, pipeline: PipelineId, run: RunId, line: &str) -> Result<()> {
        self.inner.append_log(pipeline, run, line)
    }

    fn read_log(&self, pipeline: PipelineId, run: RunId) -> Result<Vec<String>> {
        self.inner.read_log(pipeline, run)
    }
}
