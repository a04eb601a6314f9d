// src/engine/worker.rs

//! Fixed-size pool of worker slots draining the run queue.

use std::any::Any;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::domain::{PipelineId, RunId, RunStatus};
use crate::engine::executor::execute_run;
use crate::engine::scheduler::Shared;

pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(shared: Arc<Shared>, size: usize) -> Self {
        let handles = (0..size.max(1))
            .map(|slot| tokio::spawn(worker_loop(slot, shared.clone())))
            .collect();
        Self { handles }
    }

    /// Wait for every slot to exit (they do once the queue is closed).
    pub(crate) async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker slot terminated abnormally");
            }
        }
    }
}

async fn worker_loop(slot: usize, shared: Arc<Shared>) {
    debug!(slot, "worker started");

    while let Ok(queued) = shared.queue.pop().await {
        let key = queued.key();
        let name = queued.pipeline_name.clone();
        debug!(slot, pipeline = %name, run_id = key.1, "worker picked up run");

        // Each run executes in its own task so a panic is contained and
        // this slot keeps serving.
        let result = tokio::spawn(execute_run(shared.clone(), queued)).await;

        if let Err(e) = result {
            let message = if e.is_panic() {
                panic_message(e.into_panic())
            } else {
                "run task was cancelled".to_string()
            };
            error!(slot, pipeline = %name, run_id = key.1, %message, "run execution panicked");
            fail_after_panic(&shared, key, message).await;
        }

        shared.release(key);
    }

    info!(slot, "worker exiting; queue closed");
}

async fn fail_after_panic(
    shared: &Shared,
    key: (PipelineId, RunId),
    message: String,
) {
    let mut run = match shared.store.get_run(key.0, key.1) {
        Ok(Some(run)) => run,
        Ok(None) => return,
        Err(e) => {
            error!(pipeline = %key.0, run_id = key.1, error = %e, "failed to load run after panic");
            return;
        }
    };
    if run.is_terminal() {
        return;
    }

    if run
        .finish_with_error(RunStatus::Failed, format!("panic: {message}"))
        .is_ok()
    {
        shared.persist(&run).await;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
