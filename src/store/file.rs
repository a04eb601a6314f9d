use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::domain::{Pipeline, PipelineId, PipelineRun, RunId};
use crate::errors::{ConveyorError, Result};
use crate::store::Store;

/// Name of the counter file kept next to pipeline and run documents.
const COUNTER_FILE: &str = "last_id";

/// JSON documents under a data directory:
///
/// ```text
/// <root>/pipelines/<id>.json
/// <root>/pipelines/last_id
/// <root>/runs/<pipeline>/<run>.json
/// <root>/runs/<pipeline>/<run>.log
/// <root>/runs/<pipeline>/last_id
/// ```
///
/// Documents are written to a sibling temp file and renamed into place, so
/// readers never observe a half-written record.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    /// Serializes id allocation (read counter, bump, write back).
    counters: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("pipelines"))?;
        fs::create_dir_all(root.join("runs"))?;
        debug!(root = ?root, "opened file store");
        Ok(Self {
            root,
            counters: Mutex::new(()),
        })
    }

    fn pipelines_dir(&self) -> PathBuf {
        self.root.join("pipelines")
    }

    fn pipeline_path(&self, id: PipelineId) -> PathBuf {
        self.pipelines_dir().join(format!("{id}.json"))
    }

    fn runs_dir(&self, pipeline: PipelineId) -> PathBuf {
        self.root.join("runs").join(pipeline.to_string())
    }

    fn run_path(&self, pipeline: PipelineId, run: RunId) -> PathBuf {
        self.runs_dir(pipeline).join(format!("{run}.json"))
    }

    fn log_path(&self, pipeline: PipelineId, run: RunId) -> PathBuf {
        self.runs_dir(pipeline).join(format!("{run}.log"))
    }

    /// Allocate `max(counter, highest numbered document) + 1` in `dir`.
    fn allocate_id(&self, dir: &Path) -> Result<u64> {
        let _guard = self.counters.lock().unwrap_or_else(|e| e.into_inner());

        let counter_path = dir.join(COUNTER_FILE);
        let counter = match fs::read_to_string(&counter_path) {
            Ok(s) => s.trim().parse::<u64>().map_err(|e| {
                ConveyorError::StoreWriteFailure(format!(
                    "corrupt id counter at {:?}: {e}",
                    counter_path
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let highest = numbered_documents(dir)?.into_iter().max().unwrap_or(0);
        let next = counter.max(highest) + 1;

        write_atomic(&counter_path, next.to_string().as_bytes())?;
        Ok(next)
    }
}

impl Store for FileStore {
    fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        write_json(&self.pipeline_path(pipeline.id), pipeline)
    }

    fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        read_json(&self.pipeline_path(id))
    }

    fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        let mut ids = numbered_documents(&self.pipelines_dir())?;
        ids.sort_unstable();

        let mut pipelines = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = self.get_pipeline(PipelineId(id))? {
                pipelines.push(p);
            }
        }
        Ok(pipelines)
    }

    fn delete_pipeline(&self, id: PipelineId) -> Result<()> {
        match fs::remove_file(self.pipeline_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConveyorError::StoreWriteFailure(format!(
                "deleting pipeline {id}: {e}"
            ))),
        }
    }

    fn next_pipeline_id(&self) -> Result<PipelineId> {
        self.allocate_id(&self.pipelines_dir()).map(PipelineId)
    }

    fn save_run(&self, run: &PipelineRun) -> Result<()> {
        write_json(&self.run_path(run.pipeline_id, run.id), run)
    }

    fn get_run(&self, pipeline: PipelineId, run: RunId) -> Result<Option<PipelineRun>> {
        read_json(&self.run_path(pipeline, run))
    }

    fn list_runs(&self, pipeline: PipelineId) -> Result<Vec<PipelineRun>> {
        let mut ids = numbered_documents(&self.runs_dir(pipeline))?;
        ids.sort_unstable();

        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self.get_run(pipeline, id)? {
                runs.push(r);
            }
        }
        Ok(runs)
    }

    fn next_run_id(&self, pipeline: PipelineId) -> Result<RunId> {
        let dir = self.runs_dir(pipeline);
        fs::create_dir_all(&dir)
            .map_err(|e| ConveyorError::StoreWriteFailure(format!("creating {:?}: {e}", dir)))?;
        self.allocate_id(&dir)
    }

    fn append_log(&self, pipeline: PipelineId, run: RunId, line: &str) -> Result<()> {
        let path = self.log_path(pipeline, run);
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{line}")
        };
        write().map_err(|e| ConveyorError::StoreWriteFailure(format!("appending to {:?}: {e}", path)))
    }

    fn read_log(&self, pipeline: PipelineId, run: RunId) -> Result<Vec<String>> {
        let path = self.log_path(pipeline, run);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            lines.push(line?);
        }
        Ok(lines)
    }
}

/// Ids of all `<n>.json` documents in `dir` (empty if `dir` is missing).
fn numbered_documents(dir: &Path) -> Result<Vec<u64>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };

    write().map_err(|e| ConveyorError::StoreWriteFailure(format!("writing {:?}: {e}", path)))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::domain::RunStatus;

    #[test]
    fn run_ids_resume_after_reopen() {
        let dir = tempdir().unwrap();
        let pid = PipelineId(3);

        {
            let store = FileStore::open(dir.path()).unwrap();
            assert_eq!(store.next_run_id(pid).unwrap(), 1);
            assert_eq!(store.next_run_id(pid).unwrap(), 2);
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.next_run_id(pid).unwrap(), 3);
    }

    #[test]
    fn run_ids_never_fall_behind_existing_documents() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let pipeline = Pipeline::new(PipelineId(1), "p", "/bin/p");

        // A run document written without going through the counter.
        store.save_run(&PipelineRun::new(&pipeline, 41)).unwrap();

        assert_eq!(store.next_run_id(pipeline.id).unwrap(), 42);
    }

    #[test]
    fn round_trips_runs_and_logs() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let pipeline = Pipeline::new(PipelineId(1), "p", "/bin/p");
        store.save_pipeline(&pipeline).unwrap();

        let mut run = PipelineRun::new(&pipeline, 1);
        run.transition(RunStatus::Scheduled).unwrap();
        store.save_run(&run).unwrap();
        store.append_log(pipeline.id, 1, "hello").unwrap();
        store.append_log(pipeline.id, 1, "world").unwrap();

        assert_eq!(store.get_run(pipeline.id, 1).unwrap(), Some(run));
        assert_eq!(store.read_log(pipeline.id, 1).unwrap(), vec!["hello", "world"]);
        assert!(store.get_run(pipeline.id, 2).unwrap().is_none());
        assert!(store.read_log(pipeline.id, 2).unwrap().is_empty());
        assert_eq!(store.list_pipelines().unwrap(), vec![pipeline]);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let pipeline = Pipeline::new(PipelineId(5), "p", "/bin/p");
        store.save_pipeline(&pipeline).unwrap();

        store.delete_pipeline(pipeline.id).unwrap();
        store.delete_pipeline(pipeline.id).unwrap();
        assert!(store.get_pipeline(pipeline.id).unwrap().is_none());
    }
}
