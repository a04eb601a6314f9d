use proptest::prelude::*;
use tokio::sync::watch;

use conveyor::domain::PipelineId;
use conveyor::engine::{QueuedRun, RunQueue};

fn queued(pipeline: u64, run: u64, priority: i32) -> QueuedRun {
    let (_tx, rx) = watch::channel(None);
    QueuedRun {
        pipeline_id: PipelineId(pipeline),
        run_id: run,
        pipeline_name: format!("p{pipeline}"),
        priority,
        cancel: rx,
    }
}

/// Expected dequeue order: higher priority first, FIFO within a priority.
fn expected_order(priorities: &[i32]) -> Vec<u64> {
    let mut indexed: Vec<(usize, i32)> = priorities.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    indexed.into_iter().map(|(i, _)| i as u64 + 1).collect()
}

proptest! {
    #[test]
    fn pop_order_is_priority_then_fifo(priorities in proptest::collection::vec(-3i32..3, 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let queue = RunQueue::new();
        for (i, p) in priorities.iter().enumerate() {
            queue.push(queued(1, i as u64 + 1, *p)).unwrap();
        }
        prop_assert_eq!(queue.len(), priorities.len());

        let popped: Vec<u64> = rt.block_on(async {
            let mut out = Vec::new();
            while !queue.is_empty() {
                out.push(queue.pop().await.unwrap().run_id);
            }
            out
        });
        prop_assert_eq!(popped, expected_order(&priorities));
    }

    #[test]
    fn removal_and_close_preserve_remaining_order(
        priorities in proptest::collection::vec(-3i32..3, 1..40),
        removals in proptest::collection::vec(any::<prop::sample::Index>(), 0..10),
    ) {
        let queue = RunQueue::new();
        for (i, p) in priorities.iter().enumerate() {
            queue.push(queued(1, i as u64 + 1, *p)).unwrap();
        }

        let mut removed = Vec::new();
        for idx in removals {
            let run = idx.index(priorities.len()) as u64 + 1;
            if queue.remove(PipelineId(1), run).is_some() {
                removed.push(run);
            }
        }
        // Removing the same run twice finds nothing the second time.
        for run in &removed {
            prop_assert!(queue.remove(PipelineId(1), *run).is_none());
        }

        let drained: Vec<u64> = queue.close().into_iter().map(|q| q.run_id).collect();
        let expected: Vec<u64> = expected_order(&priorities)
            .into_iter()
            .filter(|run| !removed.contains(run))
            .collect();
        prop_assert_eq!(drained, expected);
        prop_assert!(queue.is_closed());
        prop_assert!(queue.push(queued(1, 999, 0)).is_err());
    }
}
