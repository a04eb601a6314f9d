// src/engine/queue.rs

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Mutex;

use tokio::sync::{Notify, watch};
use tracing::debug;

use crate::domain::{PipelineId, RunId};
use crate::errors::{ConveyorError, Result};
use crate::types::CancelReason;

/// A run waiting for a worker.
pub struct QueuedRun {
    pub pipeline_id: PipelineId,
    pub run_id: RunId,
    pub pipeline_name: String,
    /// Pipeline priority at enqueue time.
    pub priority: i32,
    /// Fires when the run should stop before finishing on its own.
    pub cancel: watch::Receiver<Option<CancelReason>>,
}

impl QueuedRun {
    pub fn key(&self) -> (PipelineId, RunId) {
        (self.pipeline_id, self.run_id)
    }
}

impl fmt::Debug for QueuedRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRun")
            .field("pipeline_id", &self.pipeline_id)
            .field("run_id", &self.run_id)
            .field("pipeline_name", &self.pipeline_name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

struct Entry {
    seq: u64,
    run: QueuedRun,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher priority first, then lower sequence number (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.run
            .priority
            .cmp(&other.run.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

/// Backlog of scheduled runs shared by every worker.
///
/// Ordering: higher pipeline priority first, then enqueue order. With the
/// default priority of 0 everywhere this is plain FIFO.
///
/// - `push` never blocks and fails with [`ConveyorError::QueueClosed`] once
///   the queue is closed.
/// - `pop` suspends until an entry is available or the queue is closed.
/// - `close` wakes every waiter and hands back the entries nobody took.
pub struct RunQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RunQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("RunQueue")
            .field("len", &state.heap.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, run: QueuedRun) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(ConveyorError::QueueClosed);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            debug!(
                pipeline = %run.pipeline_name,
                run_id = run.run_id,
                priority = run.priority,
                seq,
                "run enqueued"
            );
            state.heap.push(Entry { seq, run });
        }
        self.notify.notify_one();
        Ok(())
    }

    pub async fn pop(&self) -> Result<QueuedRun> {
        loop {
            // Register interest before checking state so a push or close
            // between the check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(entry) = state.heap.pop() {
                    let more = !state.heap.is_empty();
                    drop(state);
                    if more {
                        // Pass the baton; several pushes may have coalesced
                        // into a single stored permit.
                        self.notify.notify_one();
                    }
                    return Ok(entry.run);
                }
                if state.closed {
                    return Err(ConveyorError::QueueClosed);
                }
            }

            notified.await;
        }
    }

    /// Take a specific run out of the backlog (cancel before start).
    pub fn remove(&self, pipeline: PipelineId, run: RunId) -> Option<QueuedRun> {
        let mut state = self.lock();
        let entries = std::mem::take(&mut state.heap).into_vec();

        let mut removed = None;
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            if removed.is_none() && entry.run.key() == (pipeline, run) {
                removed = Some(entry.run);
            } else {
                kept.push(entry);
            }
        }
        state.heap = BinaryHeap::from(kept);
        removed
    }

    /// Close the queue and return the undispatched runs in dequeue order.
    pub fn close(&self) -> Vec<QueuedRun> {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            let heap = std::mem::take(&mut state.heap);
            // into_sorted_vec is ascending; dequeue order is descending.
            let mut entries = heap.into_sorted_vec();
            entries.reverse();
            entries.into_iter().map(|e| e.run).collect::<Vec<_>>()
        };
        self.notify.notify_waiters();
        debug!(drained = drained.len(), "run queue closed");
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn queued(pipeline: u64, run: RunId, priority: i32) -> QueuedRun {
        let (_tx, rx) = watch::channel(None);
        QueuedRun {
            pipeline_id: PipelineId(pipeline),
            run_id: run,
            pipeline_name: format!("p{pipeline}"),
            priority,
            cancel: rx,
        }
    }

    #[tokio::test]
    async fn fifo_when_priorities_match() {
        let q = RunQueue::new();
        for run in 1..=3 {
            q.push(queued(1, run, 0)).unwrap();
        }
        for run in 1..=3 {
            assert_eq!(q.pop().await.unwrap().run_id, run);
        }
    }

    #[tokio::test]
    async fn higher_priority_jumps_ahead() {
        let q = RunQueue::new();
        q.push(queued(1, 1, 0)).unwrap();
        q.push(queued(2, 1, 5)).unwrap();
        q.push(queued(1, 2, 0)).unwrap();

        let order: Vec<_> = [q.pop().await, q.pop().await, q.pop().await]
            .into_iter()
            .map(|r| r.unwrap().key())
            .collect();
        assert_eq!(
            order,
            vec![(PipelineId(2), 1), (PipelineId(1), 1), (PipelineId(1), 2)]
        );
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let q = Arc::new(RunQueue::new());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        q.push(queued(1, 7, 0)).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.run_id, 7);
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_returns_backlog() {
        let q = Arc::new(RunQueue::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.pop().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(q.close().is_empty());
        for w in waiters {
            let res = tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(res, Err(ConveyorError::QueueClosed)));
        }

        assert!(matches!(q.push(queued(1, 1, 0)), Err(ConveyorError::QueueClosed)));
    }

    #[test]
    fn close_drains_in_dequeue_order() {
        let q = RunQueue::new();
        q.push(queued(1, 1, 0)).unwrap();
        q.push(queued(1, 2, 3)).unwrap();
        q.push(queued(1, 3, 0)).unwrap();

        let drained: Vec<_> = q.close().into_iter().map(|r| r.run_id).collect();
        assert_eq!(drained, vec![2, 1, 3]);
        assert!(q.is_closed());
        assert!(q.is_empty());
    }

    #[test]
    fn remove_takes_only_the_named_run() {
        let q = RunQueue::new();
        q.push(queued(1, 1, 0)).unwrap();
        q.push(queued(1, 2, 0)).unwrap();

        assert_eq!(q.remove(PipelineId(1), 2).map(|r| r.run_id), Some(2));
        assert!(q.remove(PipelineId(1), 2).is_none());
        assert_eq!(q.len(), 1);
    }
}
