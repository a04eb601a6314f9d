// src/discovery/ticker.rs

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::discovery::Discovery;
use crate::errors::{ConveyorError, Result};

/// Handle for the background discovery loop.
///
/// Keeps the optional `notify` watcher alive; dropping the handle without
/// calling [`DiscoveryHandle::stop`] leaves the loop running until the
/// runtime shuts down.
pub struct DiscoveryHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    watcher: Option<RecommendedWatcher>,
}

impl std::fmt::Debug for DiscoveryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryHandle")
            .field("watching", &self.watcher.is_some())
            .finish_non_exhaustive()
    }
}

impl DiscoveryHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "discovery loop terminated abnormally");
        }
    }
}

/// Run `discovery.sync()` now, then on every tick and on folder changes.
pub fn spawn_discovery(mut discovery: Discovery) -> Result<DiscoveryHandle> {
    let options = discovery.options().clone();

    // Channel from the blocking notify callback into the async world.
    let (rescan_tx, mut rescan_rx) = mpsc::unbounded_channel::<()>();

    let watcher = if options.watch {
        std::fs::create_dir_all(&options.pipelines_dir)?;
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_access() {
                        return;
                    }
                    let _ = rescan_tx.send(());
                }
                Err(err) => {
                    eprintln!("conveyor: pipeline folder watch error: {err}");
                }
            },
            Config::default(),
        )
        .map_err(|e| ConveyorError::Other(e.into()))?;
        watcher
            .watch(&options.pipelines_dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConveyorError::Other(e.into()))?;
        info!(dir = ?options.pipelines_dir, "watching pipelines folder");
        Some(watcher)
    } else {
        drop(rescan_tx);
        None
    };

    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = interval(options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching = options.watch;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                msg = rescan_rx.recv(), if watching => {
                    if msg.is_none() {
                        watching = false;
                        continue;
                    }
                    // Coalesce a burst of events into one scan.
                    while rescan_rx.try_recv().is_ok() {}
                    debug!("pipelines folder changed; rescanning");
                }
                _ = stop_rx.changed() => break,
            }

            if let Err(e) = discovery.sync() {
                warn!(error = %e, "pipeline discovery failed");
            }
        }
        debug!("discovery loop finished");
    });

    Ok(DiscoveryHandle {
        stop_tx,
        task,
        watcher,
    })
}
