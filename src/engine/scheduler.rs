// src/engine/scheduler.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::domain::{Pipeline, PipelineId, PipelineRun, RunId, RunStatus};
use crate::engine::queue::{QueuedRun, RunQueue};
use crate::engine::worker::WorkerPool;
use crate::errors::{ConveyorError, Result};
use crate::plugin::PluginConnector;
use crate::store::{RetryPolicy, Store, save_run_with_retry};
use crate::types::CancelReason;

/// Knobs consumed by the scheduler and its workers.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Number of worker slots; clamped to at least 1.
    pub workers: usize,
    /// Upper bound on a single job's execution; `None` waits forever.
    pub job_timeout: Option<Duration>,
    /// Retry policy for run-record writes made by workers.
    pub store_retry: RetryPolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            job_timeout: None,
            store_retry: RetryPolicy::default(),
        }
    }
}

type CancelSender = watch::Sender<Option<CancelReason>>;

/// State shared by the scheduler handle and the worker tasks.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) connector: Arc<dyn PluginConnector>,
    pub(crate) queue: RunQueue,
    pub(crate) options: SchedulerOptions,
    pipelines: RwLock<HashMap<PipelineId, Pipeline>>,
    /// Runs that are queued or executing. Used both for the per-pipeline
    /// concurrency limit and to deliver cancellation.
    active: Mutex<HashMap<(PipelineId, RunId), CancelSender>>,
}

impl Shared {
    pub(crate) fn pipeline(&self, id: PipelineId) -> Option<Pipeline> {
        self.pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<(PipelineId, RunId), CancelSender>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget a run once its worker is done with it.
    pub(crate) fn release(&self, key: (PipelineId, RunId)) {
        self.active().remove(&key);
    }

    /// Persist a run record from a worker; exhaustion is logged, not raised.
    pub(crate) async fn persist(&self, run: &PipelineRun) {
        if let Err(e) = save_run_with_retry(self.store.as_ref(), run, self.options.store_retry).await
        {
            error!(
                pipeline = %run.pipeline_name,
                run_id = run.id,
                status = ?run.status,
                error = %e,
                "giving up persisting run"
            );
        }
    }

    /// Mark a run the worker never got to as `Canceled`.
    async fn cancel_undispatched(&self, queued: &QueuedRun) {
        self.release(queued.key());

        let mut run = match self.store.get_run(queued.pipeline_id, queued.run_id) {
            Ok(Some(run)) => run,
            Ok(None) => {
                warn!(
                    pipeline = %queued.pipeline_name,
                    run_id = queued.run_id,
                    "queued run has no stored record"
                );
                return;
            }
            Err(e) => {
                error!(
                    pipeline = %queued.pipeline_name,
                    run_id = queued.run_id,
                    error = %e,
                    "failed to load queued run"
                );
                return;
            }
        };

        match run.transition(RunStatus::Canceled) {
            Ok(()) => self.persist(&run).await,
            Err(e) => warn!(
                pipeline = %queued.pipeline_name,
                run_id = queued.run_id,
                error = %e,
                "cannot cancel queued run"
            ),
        }
    }
}

/// Accepts run requests, owns the queue and the worker pool.
///
/// Cheap to clone; every clone drives the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    started: Arc<AtomicBool>,
    pool: Arc<Mutex<Option<WorkerPool>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue", &self.shared.queue)
            .field("options", &self.shared.options)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Build a scheduler and load the registered pipelines from `store`.
    ///
    /// Runs left behind by a previous process are recovered here: runs that
    /// never started go back into the queue, runs that were executing are
    /// marked `Failed`. Recovered runs count against the concurrency limit,
    /// and runs can be scheduled right away; everything waits in the queue
    /// until [`Scheduler::init`] starts the workers.
    pub fn new(
        store: Arc<dyn Store>,
        connector: Arc<dyn PluginConnector>,
        options: SchedulerOptions,
    ) -> Result<Self> {
        let pipelines = store
            .list_pipelines()?
            .into_iter()
            .map(|p| (p.id, p))
            .collect::<HashMap<_, _>>();
        debug!(count = pipelines.len(), "loaded pipelines from store");

        let scheduler = Self {
            shared: Arc::new(Shared {
                store,
                connector,
                queue: RunQueue::new(),
                options,
                pipelines: RwLock::new(pipelines),
                active: Mutex::new(HashMap::new()),
            }),
            started: Arc::new(AtomicBool::new(false)),
            pool: Arc::new(Mutex::new(None)),
        };
        scheduler.recover_runs()?;
        Ok(scheduler)
    }

    /// Start the worker pool. Calling it again is a no-op.
    pub fn init(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("scheduler already initialised");
            return Ok(());
        }

        let workers = self.shared.options.workers.max(1);
        let pool = WorkerPool::spawn(self.shared.clone(), workers);
        *self.pool.lock().unwrap_or_else(|e| e.into_inner()) = Some(pool);
        info!(workers, "scheduler started");
        Ok(())
    }

    fn recover_runs(&self) -> Result<()> {
        for pipeline in self.pipelines() {
            let mut requeued = false;

            for mut run in self.shared.store.list_runs(pipeline.id)? {
                match run.status {
                    RunStatus::Running => {
                        warn!(
                            pipeline = %pipeline.name,
                            run_id = run.id,
                            "run was interrupted by a restart; marking failed"
                        );
                        run.finish_with_error(RunStatus::Failed, "interrupted by server restart")?;
                        self.shared.store.save_run(&run)?;
                    }
                    RunStatus::NotScheduled | RunStatus::Scheduled => {
                        if requeued && !pipeline.concurrent {
                            run.finish_with_error(
                                RunStatus::Canceled,
                                "superseded by an earlier pending run after restart",
                            )?;
                            self.shared.store.save_run(&run)?;
                            continue;
                        }
                        if run.status == RunStatus::NotScheduled {
                            run.transition(RunStatus::Scheduled)?;
                            self.shared.store.save_run(&run)?;
                        }
                        info!(pipeline = %pipeline.name, run_id = run.id, "re-enqueueing pending run");
                        self.enqueue(&pipeline, &mut run)?;
                        requeued = true;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Allocate an id for a pipeline that is about to be registered.
    pub fn next_pipeline_id(&self) -> Result<PipelineId> {
        self.shared.store.next_pipeline_id()
    }

    /// Register (or replace) a pipeline definition.
    pub fn register_pipeline(&self, pipeline: Pipeline) -> Result<()> {
        self.shared.store.save_pipeline(&pipeline)?;
        info!(
            pipeline = %pipeline.name,
            id = %pipeline.id,
            pipeline_type = %pipeline.pipeline_type,
            "pipeline registered"
        );
        self.shared
            .pipelines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pipeline.id, pipeline);
        Ok(())
    }

    /// Forget a pipeline. Runs already queued for it fail when dequeued.
    pub fn remove_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        self.shared.store.delete_pipeline(id)?;
        let removed = self
            .shared
            .pipelines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(p) = &removed {
            info!(pipeline = %p.name, id = %id, "pipeline removed");
        }
        Ok(removed)
    }

    pub fn pipeline(&self, id: PipelineId) -> Option<Pipeline> {
        self.shared.pipeline(id)
    }

    pub fn pipeline_by_name(&self, name: &str) -> Option<Pipeline> {
        self.shared
            .pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|p| p.name == name)
            .cloned()
    }

    /// All registered pipelines, ordered by id.
    pub fn pipelines(&self) -> Vec<Pipeline> {
        let mut all: Vec<_> = self
            .shared
            .pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|p| p.id);
        all
    }

    /// Create a run for `id` and put it in the queue.
    ///
    /// Returns as soon as the run is recorded `Scheduled`; execution happens
    /// on a worker.
    pub fn schedule(&self, id: PipelineId) -> Result<RunId> {
        let pipeline = self
            .pipeline(id)
            .ok_or(ConveyorError::UnknownPipeline(id))?;

        // Held across the check and the insert so two callers cannot both
        // pass the concurrency check.
        let mut active = self.shared.active();
        if !pipeline.concurrent && active.keys().any(|(p, _)| *p == id) {
            debug!(pipeline = %pipeline.name, "refusing run; pipeline already active");
            return Err(ConveyorError::ConcurrencyLimit(id));
        }

        let store = &self.shared.store;
        let run_id = store.next_run_id(id)?;
        let mut run = PipelineRun::new(&pipeline, run_id);
        store.save_run(&run)?;
        if let Err(e) = run
            .transition(RunStatus::Scheduled)
            .and_then(|()| store.save_run(&run))
        {
            self.abandon(&mut run, &e);
            return Err(e);
        }

        let (tx, rx) = watch::channel(None);
        active.insert((id, run_id), tx);

        let queued = QueuedRun {
            pipeline_id: id,
            run_id,
            pipeline_name: pipeline.name.clone(),
            priority: pipeline.priority,
            cancel: rx,
        };
        if let Err(e) = self.shared.queue.push(queued) {
            active.remove(&(id, run_id));
            drop(active);
            warn!(pipeline = %pipeline.name, run_id, "queue closed; canceling new run");
            run.transition(RunStatus::Canceled)?;
            store.save_run(&run)?;
            return Err(e);
        }

        info!(pipeline = %pipeline.name, run_id, "run scheduled");
        Ok(run_id)
    }

    /// Best-effort `Canceled` for a run whose scheduling failed after its
    /// first write, so a later restart does not pick it up.
    fn abandon(&self, run: &mut PipelineRun, cause: &ConveyorError) {
        warn!(
            pipeline = %run.pipeline_name,
            run_id = run.id,
            error = %cause,
            "scheduling failed; canceling partial run"
        );
        let canceled = run
            .finish_with_error(RunStatus::Canceled, format!("scheduling failed: {cause}"))
            .and_then(|()| self.shared.store.save_run(run));
        if let Err(e) = canceled {
            error!(
                pipeline = %run.pipeline_name,
                run_id = run.id,
                error = %e,
                "could not record canceled run"
            );
        }
    }

    /// Queue an already persisted `Scheduled` run (restart recovery).
    fn enqueue(&self, pipeline: &Pipeline, run: &mut PipelineRun) -> Result<()> {
        let (tx, rx) = watch::channel(None);
        self.shared.active().insert((pipeline.id, run.id), tx);

        let queued = QueuedRun {
            pipeline_id: pipeline.id,
            run_id: run.id,
            pipeline_name: pipeline.name.clone(),
            priority: pipeline.priority,
            cancel: rx,
        };
        if let Err(e) = self.shared.queue.push(queued) {
            self.shared.release((pipeline.id, run.id));
            run.transition(RunStatus::Canceled)?;
            self.shared.store.save_run(run)?;
            return Err(e);
        }
        Ok(())
    }

    pub fn get_run(&self, pipeline: PipelineId, run: RunId) -> Result<PipelineRun> {
        self.shared
            .store
            .get_run(pipeline, run)?
            .ok_or(ConveyorError::RunNotFound { pipeline, run })
    }

    pub fn list_runs(&self, pipeline: PipelineId) -> Result<Vec<PipelineRun>> {
        self.shared.store.list_runs(pipeline)
    }

    pub fn run_log(&self, pipeline: PipelineId, run: RunId) -> Result<Vec<String>> {
        self.get_run(pipeline, run)?;
        self.shared.store.read_log(pipeline, run)
    }

    /// Number of runs that are queued or executing.
    pub fn active_runs(&self) -> usize {
        self.shared.active().len()
    }

    /// Abort a run.
    ///
    /// A queued run is taken out of the queue and marked `Canceled`. A
    /// running run has its plugin closed by the worker and also ends
    /// `Canceled`. Canceling a finished run is a no-op.
    pub async fn cancel(&self, pipeline: PipelineId, run: RunId) -> Result<()> {
        if let Some(queued) = self.shared.queue.remove(pipeline, run) {
            info!(pipeline = %queued.pipeline_name, run_id = run, "canceling queued run");
            self.shared.cancel_undispatched(&queued).await;
            return Ok(());
        }

        if let Some(tx) = self.shared.active().get(&(pipeline, run)) {
            info!(pipeline = %pipeline, run_id = run, "canceling running run");
            tx.send_replace(Some(CancelReason::User));
            return Ok(());
        }

        let record = self.get_run(pipeline, run)?;
        if !record.is_terminal() {
            warn!(
                pipeline = %record.pipeline_name,
                run_id = run,
                status = ?record.status,
                "run is not tracked by this scheduler; nothing to cancel"
            );
        }
        Ok(())
    }

    /// Stop accepting work and wind down.
    ///
    /// Undispatched runs are marked `Canceled`, executing runs are told to
    /// stop (they end `Failed`), and this waits for every worker to exit.
    pub async fn shutdown(&self) {
        info!("scheduler shutting down");

        for queued in self.shared.queue.close() {
            self.shared.cancel_undispatched(&queued).await;
        }

        for (key, tx) in self.shared.active().iter() {
            debug!(pipeline = %key.0, run_id = key.1, "signalling shutdown to run");
            tx.send_replace(Some(CancelReason::Shutdown));
        }

        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pool) = pool {
            pool.join().await;
        }
        info!("scheduler stopped");
    }
}
