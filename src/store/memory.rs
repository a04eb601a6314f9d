use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::domain::{Pipeline, PipelineId, PipelineRun, RunId};
use crate::errors::Result;
use crate::store::Store;

#[derive(Debug, Default)]
struct MemoryState {
    pipelines: BTreeMap<PipelineId, Pipeline>,
    runs: BTreeMap<(PipelineId, RunId), PipelineRun>,
    logs: HashMap<(PipelineId, RunId), Vec<String>>,
    run_counters: HashMap<PipelineId, RunId>,
    last_pipeline_id: u64,
}

/// Stores everything in memory only (lost on restart).
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock cannot leave the maps half-written,
        // so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemoryStore {
    fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let mut state = self.state();
        state.last_pipeline_id = state.last_pipeline_id.max(pipeline.id.0);
        state.pipelines.insert(pipeline.id, pipeline.clone());
        Ok(())
    }

    fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.state().pipelines.get(&id).cloned())
    }

    fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        Ok(self.state().pipelines.values().cloned().collect())
    }

    fn delete_pipeline(&self, id: PipelineId) -> Result<()> {
        self.state().pipelines.remove(&id);
        Ok(())
    }

    fn next_pipeline_id(&self) -> Result<PipelineId> {
        let mut state = self.state();
        state.last_pipeline_id += 1;
        Ok(PipelineId(state.last_pipeline_id))
    }

    fn save_run(&self, run: &PipelineRun) -> Result<()> {
        self.state()
            .runs
            .insert((run.pipeline_id, run.id), run.clone());
        Ok(())
    }

    fn get_run(&self, pipeline: PipelineId, run: RunId) -> Result<Option<PipelineRun>> {
        Ok(self.state().runs.get(&(pipeline, run)).cloned())
    }

    fn list_runs(&self, pipeline: PipelineId) -> Result<Vec<PipelineRun>> {
        Ok(self
            .state()
            .runs
            .range((pipeline, RunId::MIN)..=(pipeline, RunId::MAX))
            .map(|(_, run)| run.clone())
            .collect())
    }

    fn next_run_id(&self, pipeline: PipelineId) -> Result<RunId> {
        let mut state = self.state();
        let counter = state.run_counters.entry(pipeline).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    fn append_log(&self, pipeline: PipelineId, run: RunId, line: &str) -> Result<()> {
        self.state()
            .logs
            .entry((pipeline, run))
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    fn read_log(&self, pipeline: PipelineId, run: RunId) -> Result<Vec<String>> {
        Ok(self
            .state()
            .logs
            .get(&(pipeline, run))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_per_pipeline_and_increasing() {
        let store = MemoryStore::new();
        assert_eq!(store.next_run_id(PipelineId(1)).unwrap(), 1);
        assert_eq!(store.next_run_id(PipelineId(1)).unwrap(), 2);
        assert_eq!(store.next_run_id(PipelineId(2)).unwrap(), 1);
        assert_eq!(store.next_run_id(PipelineId(1)).unwrap(), 3);
    }

    #[test]
    fn list_runs_only_returns_requested_pipeline() {
        let store = MemoryStore::new();
        let a = Pipeline::new(PipelineId(1), "a", "/bin/a");
        let b = Pipeline::new(PipelineId(2), "b", "/bin/b");
        store.save_run(&PipelineRun::new(&a, 2)).unwrap();
        store.save_run(&PipelineRun::new(&b, 1)).unwrap();
        store.save_run(&PipelineRun::new(&a, 1)).unwrap();

        let ids: Vec<_> = store
            .list_runs(PipelineId(1))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn pipeline_ids_skip_explicitly_saved_ids() {
        let store = MemoryStore::new();
        store
            .save_pipeline(&Pipeline::new(PipelineId(7), "seven", "/bin/7"))
            .unwrap();
        assert_eq!(store.next_pipeline_id().unwrap(), PipelineId(8));
    }
}
