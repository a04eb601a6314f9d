mod common;
use crate::common::{harness, wait_for_status, wait_for_terminal, workers};

use std::sync::Arc;
use std::time::Duration;

use conveyor::domain::{JobDescriptor, JobStatus, PipelineId, RunStatus};
use conveyor::engine::SchedulerOptions;
use conveyor::errors::ConveyorError;
use conveyor::store::{MemoryStore, RetryPolicy};
use conveyor_test_utils::builders::{PipelineBuilder, linear_jobs};
use conveyor_test_utils::fake_plugin::{
    ConnectBehaviour, FakeConnector, Gate, JobBehaviour, PluginScript,
};
use conveyor_test_utils::recording_store::RecordingStore;

#[tokio::test]
async fn unknown_pipeline_is_rejected() {
    let h = harness(
        Arc::new(MemoryStore::new()),
        FakeConnector::new(PluginScript::new(linear_jobs())),
        workers(1),
        vec![],
    );
    let err = h.scheduler.schedule(PipelineId(42)).unwrap_err();
    assert!(matches!(err, ConveyorError::UnknownPipeline(PipelineId(42))));

    let err = h.scheduler.get_run(PipelineId(42), 1).unwrap_err();
    assert!(matches!(err, ConveyorError::RunNotFound { .. }));
}

#[tokio::test]
async fn non_concurrent_pipeline_allows_one_active_run() {
    let gate = Gate::new();
    let script = PluginScript::new(vec![JobDescriptor::new("deploy")])
        .job("deploy", JobBehaviour::WaitFor(gate.clone()));
    let h = harness(
        Arc::new(MemoryStore::new()),
        FakeConnector::new(script),
        workers(2),
        vec![PipelineBuilder::new(1, "release").exclusive().build()],
    );
    let pid = PipelineId(1);

    // Queued but not yet running still counts.
    let first = h.scheduler.schedule(pid).unwrap();
    let err = h.scheduler.schedule(pid).unwrap_err();
    assert!(matches!(err, ConveyorError::ConcurrencyLimit(PipelineId(1))));

    h.scheduler.init().unwrap();
    wait_for_status(&h.scheduler, pid, first, RunStatus::Running).await;
    assert!(matches!(
        h.scheduler.schedule(pid),
        Err(ConveyorError::ConcurrencyLimit(_))
    ));
    // The refused attempts left no records behind.
    assert_eq!(h.scheduler.list_runs(pid).unwrap().len(), 1);

    gate.open(2);
    wait_for_terminal(&h.scheduler, pid, first).await;
    common::wait_until(|| h.scheduler.active_runs() == 0).await;

    let second = h.scheduler.schedule(pid).unwrap();
    let run = wait_for_terminal(&h.scheduler, pid, second).await;
    assert_eq!(run.status, RunStatus::Success);
}

#[tokio::test]
async fn successful_run_walks_the_full_status_path() {
    let store = Arc::new(RecordingStore::new());
    let h = harness(
        store.clone(),
        FakeConnector::new(PluginScript::new(linear_jobs())),
        workers(1),
        vec![PipelineBuilder::new(1, "app").build()],
    );
    h.scheduler.init().unwrap();
    let pid = PipelineId(1);

    let run_id = h.scheduler.schedule(pid).unwrap();
    wait_for_terminal(&h.scheduler, pid, run_id).await;

    assert_eq!(
        store.history(pid, run_id),
        vec![
            RunStatus::NotScheduled,
            RunStatus::Scheduled,
            RunStatus::Running,
            RunStatus::Success,
        ]
    );
}

#[tokio::test]
async fn plugin_that_never_starts_fails_from_scheduled() {
    let store = Arc::new(RecordingStore::new());
    let connector = FakeConnector::new(PluginScript::new(linear_jobs()))
        .with_script(
            "slow",
            PluginScript::new(linear_jobs()).connect(ConnectBehaviour::HandshakeTimeout),
        )
        .with_script(
            "future",
            PluginScript::new(linear_jobs()).connect(ConnectBehaviour::VersionUnsupported),
        );
    let h = harness(
        store.clone(),
        connector,
        workers(1),
        vec![
            PipelineBuilder::new(1, "slow").build(),
            PipelineBuilder::new(2, "future").build(),
        ],
    );
    h.scheduler.init().unwrap();

    let slow = h.scheduler.schedule(PipelineId(1)).unwrap();
    let future = h.scheduler.schedule(PipelineId(2)).unwrap();

    let run = wait_for_terminal(&h.scheduler, PipelineId(1), slow).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.started_at.is_none());
    assert!(run.error.unwrap().contains("handshake"));
    assert_eq!(
        store.history(PipelineId(1), slow),
        vec![RunStatus::NotScheduled, RunStatus::Scheduled, RunStatus::Failed]
    );

    let run = wait_for_terminal(&h.scheduler, PipelineId(2), future).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("version unsupported"));
    assert!(run.jobs.is_empty());
}

#[tokio::test]
async fn invalid_job_list_fails_the_run() {
    let cyclic = vec![
        JobDescriptor::new("a").depends_on("b"),
        JobDescriptor::new("b").depends_on("a"),
    ];
    let connector = FakeConnector::new(PluginScript::new(cyclic)).with_script(
        "garbled",
        PluginScript::new(vec![]).get_jobs_error("unexpected frame"),
    );
    let h = harness(
        Arc::new(MemoryStore::new()),
        connector,
        workers(1),
        vec![
            PipelineBuilder::new(1, "cyclic").build(),
            PipelineBuilder::new(2, "garbled").build(),
        ],
    );
    h.scheduler.init().unwrap();

    let cyclic = h.scheduler.schedule(PipelineId(1)).unwrap();
    let garbled = h.scheduler.schedule(PipelineId(2)).unwrap();

    let run = wait_for_terminal(&h.scheduler, PipelineId(1), cyclic).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("cycle"));
    assert!(h.stats.executed_jobs("cyclic").is_empty());

    let run = wait_for_terminal(&h.scheduler, PipelineId(2), garbled).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("unexpected frame"));
    assert_eq!(h.stats.open_sessions(), 0);
}

#[tokio::test]
async fn crash_mid_job_fails_run_and_skips_the_rest() {
    let script = PluginScript::new(linear_jobs())
        .job("test", JobBehaviour::Crash("connection reset".into()));
    let h = harness(
        Arc::new(MemoryStore::new()),
        FakeConnector::new(script),
        workers(1),
        vec![PipelineBuilder::new(1, "app").build()],
    );
    h.scheduler.init().unwrap();
    let pid = PipelineId(1);

    let run_id = h.scheduler.schedule(pid).unwrap();
    let run = wait_for_terminal(&h.scheduler, pid, run_id).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.job("build").unwrap().status, JobStatus::Success);
    let test = run.job("test").unwrap();
    assert_eq!(test.status, JobStatus::Failed);
    assert!(test.message.as_deref().unwrap().contains("connection reset"));
    let deploy = run.job("deploy").unwrap();
    assert_eq!(deploy.status, JobStatus::Skipped);
    assert_eq!(deploy.message.as_deref(), Some("plugin failure"));
}

#[tokio::test]
async fn job_exceeding_its_timeout_fails() {
    let script = PluginScript::new(linear_jobs()).job("build", JobBehaviour::Hang);
    let options = SchedulerOptions {
        workers: 1,
        job_timeout: Some(Duration::from_millis(50)),
        ..SchedulerOptions::default()
    };
    let h = harness(
        Arc::new(MemoryStore::new()),
        FakeConnector::new(script),
        options,
        vec![PipelineBuilder::new(1, "app").build()],
    );
    h.scheduler.init().unwrap();
    let pid = PipelineId(1);

    let run_id = h.scheduler.schedule(pid).unwrap();
    let run = wait_for_terminal(&h.scheduler, pid, run_id).await;

    assert_eq!(run.status, RunStatus::Failed);
    let build = run.job("build").unwrap();
    assert_eq!(build.status, JobStatus::Failed);
    assert!(build.message.as_deref().unwrap().contains("exceeded its timeout"));
    assert_eq!(run.job("test").unwrap().status, JobStatus::Skipped);
    assert_eq!(h.stats.closed(), 1);
}

#[tokio::test]
async fn run_for_removed_pipeline_fails_when_dequeued() {
    let h = harness(
        Arc::new(MemoryStore::new()),
        FakeConnector::new(PluginScript::new(linear_jobs())),
        workers(1),
        vec![PipelineBuilder::new(1, "app").build()],
    );
    let pid = PipelineId(1);

    let run_id = h.scheduler.schedule(pid).unwrap();
    assert!(h.scheduler.remove_pipeline(pid).unwrap().is_some());
    h.scheduler.init().unwrap();

    let run = wait_for_terminal(&h.scheduler, pid, run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(h.stats.connects(), 0);
}

#[tokio::test]
async fn transient_store_failures_are_retried() {
    let store = Arc::new(RecordingStore::new());
    let options = SchedulerOptions {
        workers: 1,
        store_retry: RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        ..SchedulerOptions::default()
    };
    let h = harness(
        store.clone(),
        FakeConnector::new(PluginScript::new(linear_jobs())),
        options,
        vec![PipelineBuilder::new(1, "app").build()],
    );
    let pid = PipelineId(1);

    let run_id = h.scheduler.schedule(pid).unwrap();
    store.fail_next_saves(2);
    h.scheduler.init().unwrap();

    let run = wait_for_terminal(&h.scheduler, pid, run_id).await;
    assert_eq!(run.status, RunStatus::Success);
    assert!(store.history(pid, run_id).contains(&RunStatus::Running));
}

#[tokio::test]
async fn failed_schedule_leaves_no_runnable_record() {
    let store = Arc::new(RecordingStore::new());
    let pid = PipelineId(1);
    {
        let h = harness(
            store.clone(),
            FakeConnector::new(PluginScript::new(linear_jobs())),
            workers(1),
            vec![PipelineBuilder::new(1, "app").exclusive().build()],
        );

        // The `NotScheduled` write lands, the `Scheduled` one does not.
        store.fail_nth_save(2);
        let err = h.scheduler.schedule(pid).unwrap_err();
        assert!(matches!(err, ConveyorError::IoError(_)), "got {err:?}");
        assert_eq!(h.scheduler.active_runs(), 0);

        let runs = h.scheduler.list_runs(pid).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Canceled);
        assert!(runs[0].error.as_deref().unwrap().starts_with("scheduling failed"));
    }

    // A restart must not pick the abandoned run up.
    let h = harness(
        store.clone(),
        FakeConnector::new(PluginScript::new(linear_jobs())),
        workers(1),
        vec![],
    );
    h.scheduler.init().unwrap();
    assert_eq!(h.scheduler.active_runs(), 0);

    // The pipeline is not blocked by the failed attempt.
    let run_id = h.scheduler.schedule(pid).unwrap();
    let run = wait_for_terminal(&h.scheduler, pid, run_id).await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(h.stats.connects(), 1);
}
