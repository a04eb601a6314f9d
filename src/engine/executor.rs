// src/engine/executor.rs

//! Executes one dequeued run from plugin launch to terminal status.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::dag::{JobPlan, PlanStep};
use crate::domain::{JobOutcome, JobRecord, JobStatus, PipelineRun, RunStatus};
use crate::engine::queue::QueuedRun;
use crate::engine::scheduler::Shared;
use crate::errors::{ConveyorError, Result};
use crate::plugin::PluginSession;
use crate::types::CancelReason;

/// Either the awaited work finished, or the run was told to stop first.
enum Interruptible<T> {
    Done(T),
    Canceled(CancelReason),
}

/// Resolves once a cancel reason is set. Never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<Option<CancelReason>>) -> CancelReason {
    loop {
        let current = *rx.borrow_and_update();
        if let Some(reason) = current {
            return reason;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn interruptible<T>(
    fut: impl Future<Output = T>,
    cancel: &mut watch::Receiver<Option<CancelReason>>,
) -> Interruptible<T> {
    tokio::select! {
        out = fut => Interruptible::Done(out),
        reason = cancelled(cancel) => Interruptible::Canceled(reason),
    }
}

/// Final status for a run stopped by `reason`.
///
/// User cancels always end `Canceled`. A shutdown only cancels runs that
/// never started; a run interrupted mid-flight has an unknown outcome and
/// ends `Failed`.
fn status_for_cancel(reason: CancelReason, started: bool) -> (RunStatus, &'static str) {
    match (reason, started) {
        (CancelReason::User, _) => (RunStatus::Canceled, "canceled by user"),
        (CancelReason::Shutdown, false) => (RunStatus::Canceled, "canceled by server shutdown"),
        (CancelReason::Shutdown, true) => (RunStatus::Failed, "interrupted by server shutdown"),
    }
}

pub(crate) async fn execute_run(shared: Arc<Shared>, queued: QueuedRun) {
    let QueuedRun {
        pipeline_id,
        run_id,
        pipeline_name,
        mut cancel,
        ..
    } = queued;

    let mut run = match shared.store.get_run(pipeline_id, run_id) {
        Ok(Some(run)) => run,
        Ok(None) => {
            error!(pipeline = %pipeline_name, run_id, "dequeued run has no stored record");
            return;
        }
        Err(e) => {
            error!(pipeline = %pipeline_name, run_id, error = %e, "failed to load dequeued run");
            return;
        }
    };
    if run.is_terminal() {
        debug!(pipeline = %pipeline_name, run_id, status = ?run.status, "run already finished");
        return;
    }

    let executor = RunExecutor {
        shared: shared.clone(),
        cancel: &mut cancel,
    };
    executor.drive(&mut run).await;
}

struct RunExecutor<'a> {
    shared: Arc<Shared>,
    cancel: &'a mut watch::Receiver<Option<CancelReason>>,
}

impl RunExecutor<'_> {
    async fn drive(mut self, run: &mut PipelineRun) {
        let pending = *self.cancel.borrow();
        if let Some(reason) = pending {
            let (status, message) = status_for_cancel(reason, false);
            self.finish(run, status, message).await;
            return;
        }

        let Some(pipeline) = self.shared.pipeline(run.pipeline_id) else {
            self.finish(run, RunStatus::Failed, "pipeline was removed before the run started")
                .await;
            return;
        };

        let connector = self.shared.connector.clone();
        let session = match interruptible(connector.connect(&pipeline), self.cancel).await {
            Interruptible::Done(Ok(session)) => session,
            Interruptible::Done(Err(e)) => {
                if e.is_plugin_error() {
                    warn!(pipeline = %pipeline.name, run_id = run.id, error = %e, "plugin did not start");
                } else {
                    error!(pipeline = %pipeline.name, run_id = run.id, error = %e, "connecting to plugin failed");
                }
                self.finish(run, RunStatus::Failed, &e.to_string()).await;
                return;
            }
            Interruptible::Canceled(reason) => {
                let (status, message) = status_for_cancel(reason, false);
                self.finish(run, status, message).await;
                return;
            }
        };

        if let Err(e) = run.transition(RunStatus::Running) {
            error!(pipeline = %pipeline.name, run_id = run.id, error = %e, "cannot start run");
            close_session(session, &pipeline.name).await;
            return;
        }
        self.shared.persist(run).await;
        info!(pipeline = %pipeline.name, run_id = run.id, "run started");

        let (status, error) = self.run_jobs(run, session).await;
        match error {
            Some(message) => self.finish(run, status, &message).await,
            None => {
                if let Err(e) = run.transition(status) {
                    error!(pipeline = %run.pipeline_name, run_id = run.id, error = %e, "invalid final transition");
                }
                self.shared.persist(run).await;
            }
        }

        info!(
            pipeline = %run.pipeline_name,
            run_id = run.id,
            status = ?run.status,
            "run finished"
        );
    }

    /// Drive the job plan. Always closes the session before returning.
    async fn run_jobs(
        &mut self,
        run: &mut PipelineRun,
        mut session: Box<dyn PluginSession>,
    ) -> (RunStatus, Option<String>) {
        let plan = match interruptible(session.get_jobs(), self.cancel).await {
            Interruptible::Done(jobs) => jobs.and_then(JobPlan::new),
            Interruptible::Canceled(reason) => {
                close_session(session, &run.pipeline_name).await;
                let (status, message) = status_for_cancel(reason, true);
                return (status, Some(message.to_string()));
            }
        };
        let mut plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                warn!(pipeline = %run.pipeline_name, run_id = run.id, error = %e, "unusable job list");
                close_session(session, &run.pipeline_name).await;
                return (RunStatus::Failed, Some(e.to_string()));
            }
        };

        while let Some(step) = plan.next_step() {
            let job = match step {
                PlanStep::Skip { job, reason } => {
                    self.log_line(run, &format!("[{job}] skipped: {reason}"));
                    run.record_job(JobRecord::skipped(job, reason));
                    self.shared.persist(run).await;
                    continue;
                }
                PlanStep::Run(job) => job,
            };

            info!(pipeline = %run.pipeline_name, run_id = run.id, job = %job, "executing job");
            let started_at = Utc::now();
            let outcome = self.execute_job(run, session.as_mut(), &job).await;
            let mut record = JobRecord {
                name: job.clone(),
                status: JobStatus::Success,
                message: None,
                started_at: Some(started_at),
                finished_at: Some(Utc::now()),
            };

            match outcome {
                Interruptible::Done(Ok(JobOutcome::Success)) => {
                    plan.complete(&job, JobStatus::Success);
                    run.record_job(record);
                    self.shared.persist(run).await;
                }
                Interruptible::Done(Ok(JobOutcome::Failure(message))) => {
                    info!(pipeline = %run.pipeline_name, run_id = run.id, job = %job, %message, "job failed");
                    plan.complete(&job, JobStatus::Failed);
                    record.status = JobStatus::Failed;
                    record.message = Some(message);
                    run.record_job(record);
                    self.shared.persist(run).await;
                }
                Interruptible::Done(Err(e)) => {
                    warn!(pipeline = %run.pipeline_name, run_id = run.id, job = %job, error = %e, "plugin failed during job");
                    plan.complete(&job, JobStatus::Failed);
                    record.status = JobStatus::Failed;
                    record.message = Some(e.to_string());
                    run.record_job(record);
                    self.skip_rest(run, &mut plan, "plugin failure");
                    close_session(session, &run.pipeline_name).await;
                    return (RunStatus::Failed, Some(e.to_string()));
                }
                Interruptible::Canceled(reason) => {
                    let crashed = ConveyorError::PluginCrashed(format!(
                        "job '{job}' interrupted: plugin closed"
                    ));
                    plan.complete(&job, JobStatus::Failed);
                    record.status = JobStatus::Failed;
                    record.message = Some(crashed.to_string());
                    run.record_job(record);
                    self.skip_rest(run, &mut plan, "run stopped");
                    close_session(session, &run.pipeline_name).await;
                    let (status, message) = status_for_cancel(reason, true);
                    return (status, Some(message.to_string()));
                }
            }
        }

        close_session(session, &run.pipeline_name).await;

        match plan.first_failure() {
            None if plan.all_succeeded() => (RunStatus::Success, None),
            Some(job) => (RunStatus::Failed, Some(format!("job '{job}' failed"))),
            None => (RunStatus::Failed, Some("not every job succeeded".to_string())),
        }
    }

    /// Execute one job, streaming its log lines into the store.
    async fn execute_job(
        &mut self,
        run: &PipelineRun,
        session: &mut dyn PluginSession,
        job: &str,
    ) -> Interruptible<Result<JobOutcome>> {
        let store = self.shared.store.clone();
        let (pipeline_id, run_id) = (run.pipeline_id, run.id);
        let mut forward = |line: &str| {
            if let Err(e) = store.append_log(pipeline_id, run_id, &format!("[{job}] {line}")) {
                warn!(pipeline = %pipeline_id, run_id, error = %e, "failed to store log line");
            }
        };

        let job_timeout = self.shared.options.job_timeout;
        let work = async {
            let exec = session.execute(job, &mut forward);
            match job_timeout {
                Some(limit) => match timeout(limit, exec).await {
                    Ok(res) => res,
                    Err(_) => Err(ConveyorError::JobTimeout {
                        job: job.to_string(),
                        timeout: limit,
                    }),
                },
                None => exec.await,
            }
        };

        interruptible(work, self.cancel).await
    }

    fn skip_rest(&self, run: &mut PipelineRun, plan: &mut JobPlan, reason: &str) {
        for job in plan.skip_remaining() {
            run.record_job(JobRecord::skipped(job, reason));
        }
    }

    fn log_line(&self, run: &PipelineRun, line: &str) {
        if let Err(e) = self.shared.store.append_log(run.pipeline_id, run.id, line) {
            warn!(pipeline = %run.pipeline_name, run_id = run.id, error = %e, "failed to store log line");
        }
    }

    async fn finish(&self, run: &mut PipelineRun, status: RunStatus, message: &str) {
        if let Err(e) = run.finish_with_error(status, message) {
            error!(
                pipeline = %run.pipeline_name,
                run_id = run.id,
                error = %e,
                "invalid final transition"
            );
            return;
        }
        self.shared.persist(run).await;
        debug!(pipeline = %run.pipeline_name, run_id = run.id, status = ?status, %message, "run ended early");
    }
}

async fn close_session(session: Box<dyn PluginSession>, pipeline: &str) {
    if let Err(e) = session.close().await {
        warn!(pipeline, error = %e, "error while closing plugin");
    }
}
