#![allow(dead_code)]

use std::sync::Arc;

use conveyor::domain::Pipeline;
use conveyor::engine::{Scheduler, SchedulerOptions};
use conveyor::store::Store;
use conveyor_test_utils::fake_plugin::{FakeConnector, FakeStats};

pub use conveyor_test_utils::{init_tracing, wait_for_status, wait_for_terminal, wait_until, with_timeout};

/// A scheduler wired to a fake connector, with `pipelines` registered.
pub struct Harness {
    pub scheduler: Scheduler,
    pub stats: Arc<FakeStats>,
    pub connector: Arc<FakeConnector>,
}

pub fn harness(
    store: Arc<dyn Store>,
    connector: FakeConnector,
    options: SchedulerOptions,
    pipelines: Vec<Pipeline>,
) -> Harness {
    init_tracing();
    let connector = Arc::new(connector);
    let stats = connector.stats();
    let scheduler = Scheduler::new(store, connector.clone(), options).unwrap();
    for pipeline in pipelines {
        scheduler.register_pipeline(pipeline).unwrap();
    }
    Harness {
        scheduler,
        stats,
        connector,
    }
}

pub fn workers(n: usize) -> SchedulerOptions {
    SchedulerOptions {
        workers: n,
        ..SchedulerOptions::default()
    }
}
