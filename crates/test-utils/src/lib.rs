pub mod builders;
pub mod fake_plugin;
pub mod recording_store;

use std::sync::Once;
use std::time::Duration;

use conveyor::domain::{PipelineId, PipelineRun, RunId, RunStatus};
use conveyor::engine::Scheduler;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Poll `cond` every few milliseconds until it holds (5-second limit).
pub async fn wait_until<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    with_timeout(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

/// Wait until the stored run reaches `status`.
pub async fn wait_for_status(
    scheduler: &Scheduler,
    pipeline: PipelineId,
    run: RunId,
    status: RunStatus,
) -> PipelineRun {
    wait_until(|| {
        scheduler
            .get_run(pipeline, run)
            .map(|r| r.status == status)
            .unwrap_or(false)
    })
    .await;
    scheduler.get_run(pipeline, run).unwrap()
}

/// Wait until the stored run is `Success`, `Failed` or `Canceled`.
pub async fn wait_for_terminal(
    scheduler: &Scheduler,
    pipeline: PipelineId,
    run: RunId,
) -> PipelineRun {
    wait_until(|| {
        scheduler
            .get_run(pipeline, run)
            .map(|r| r.is_terminal())
            .unwrap_or(false)
    })
    .await;
    scheduler.get_run(pipeline, run).unwrap()
}
