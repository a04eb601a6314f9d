// src/store/mod.rs

//! Persistence for pipelines, runs and run logs.
//!
//! The scheduler only talks to the [`Store`] trait. Two implementations are
//! provided:
//! - [`MemoryStore`] keeps everything in process memory (tests, `--dry-run`).
//! - [`FileStore`] writes JSON documents under a data directory and survives
//!   restarts, including run-id allocation.
//!
//! Implementations must be safe to call from several workers at once. The
//! scheduler guarantees a single writer per run record, so stores only need
//! to make each individual write atomic.

use std::fmt::Debug;
use std::time::Duration;

use tracing::warn;

use crate::domain::{Pipeline, PipelineId, PipelineRun, RunId};
use crate::errors::{ConveyorError, Result};

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Durable key-value persistence consumed by the scheduler.
pub trait Store: Send + Sync + Debug {
    fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()>;
    fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>>;
    fn list_pipelines(&self) -> Result<Vec<Pipeline>>;
    fn delete_pipeline(&self, id: PipelineId) -> Result<()>;
    /// Allocate a fresh pipeline id; never returns the same id twice.
    fn next_pipeline_id(&self) -> Result<PipelineId>;

    fn save_run(&self, run: &PipelineRun) -> Result<()>;
    fn get_run(&self, pipeline: PipelineId, run: RunId) -> Result<Option<PipelineRun>>;
    /// All runs of a pipeline, ordered by run id.
    fn list_runs(&self, pipeline: PipelineId) -> Result<Vec<PipelineRun>>;
    /// Allocate the next run id for `pipeline`; strictly increasing, also
    /// across restarts for durable stores.
    fn next_run_id(&self, pipeline: PipelineId) -> Result<RunId>;

    fn append_log(&self, pipeline: PipelineId, run: RunId, line: &str) -> Result<()>;
    fn read_log(&self, pipeline: PipelineId, run: RunId) -> Result<Vec<String>>;
}

/// Bounded retry with exponential backoff for store writes made by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one (>= 1).
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Save `run`, retrying failed writes according to `policy`.
///
/// Returns the last error once all attempts are exhausted, converted into
/// [`ConveyorError::StoreWriteFailure`].
pub async fn save_run_with_retry(
    store: &dyn Store,
    run: &PipelineRun,
    policy: RetryPolicy,
) -> Result<()> {
    let attempts = policy.attempts.max(1);
    let mut delay = policy.initial_backoff;
    let mut attempt = 0;

    loop {
        attempt += 1;

        match store.save_run(run) {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= attempts => {
                return Err(match e {
                    ConveyorError::StoreWriteFailure(msg) => ConveyorError::StoreWriteFailure(msg),
                    other => ConveyorError::StoreWriteFailure(other.to_string()),
                });
            }
            Err(e) => {
                warn!(
                    pipeline = %run.pipeline_name,
                    run_id = run.id,
                    attempt,
                    attempts,
                    error = %e,
                    "failed to persist run; retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Fails the first `failures` run writes, then delegates.
    #[derive(Debug)]
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
        calls: Mutex<u32>,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicU32::new(failures),
                calls: Mutex::new(0),
            }
        }
    }

    impl Store for FlakyStore {
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
            *self.calls.lock().unwrap() += 1;
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ConveyorError::StoreWriteFailure("disk full".into()));
            }
            self.inner.save_run(run)
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

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn sample_run() -> PipelineRun {
        let pipeline = Pipeline::new(PipelineId(1), "build", "/bin/true");
        PipelineRun::new(&pipeline, 1)
    }

    #[tokio::test]
    async fn retries_until_write_succeeds() {
        let store = FlakyStore::new(2);
        let run = sample_run();

        save_run_with_retry(&store, &run, policy(3)).await.unwrap();

        assert_eq!(*store.calls.lock().unwrap(), 3);
        assert!(store.get_run(PipelineId(1), 1).unwrap().is_some());
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let store = FlakyStore::new(10);
        let run = sample_run();

        let err = save_run_with_retry(&store, &run, policy(3))
            .await
            .unwrap_err();

        assert!(matches!(err, ConveyorError::StoreWriteFailure(_)));
        assert_eq!(*store.calls.lock().unwrap(), 3);
    }
}
