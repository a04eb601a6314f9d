// src/discovery/mod.rs

//! Keeps the scheduler's pipeline registry in sync with the binaries in the
//! pipelines folder.
//!
//! - [`scan`] lists executable files and derives name, type and checksum.
//! - [`Discovery::sync`] reconciles one scan against the registry: new
//!   binaries are registered, changed ones re-registered under the same id,
//!   vanished ones removed.
//! - [`ticker`] drives `sync` on an interval and, optionally, on filesystem
//!   events.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{ConfigFile, PipelineSettings};
use crate::domain::{Pipeline, RunId};
use crate::engine::Scheduler;
use crate::errors::Result;

pub mod checksum;
pub mod scan;
pub mod ticker;

pub use scan::{DiscoveredBinary, NameFilter, parse_binary_name, scan_pipelines};
pub use ticker::{DiscoveryHandle, spawn_discovery};

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub pipelines_dir: PathBuf,
    pub interval: Duration,
    /// Rescan as soon as the folder changes, not just on the interval.
    pub watch: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Per-name concurrency and priority overrides.
    pub settings: BTreeMap<String, PipelineSettings>,
}

impl DiscoveryOptions {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self {
            pipelines_dir: cfg.pipelines_dir(),
            interval: cfg.discovery.interval,
            watch: cfg.discovery.watch,
            include: cfg.discovery.include.clone(),
            exclude: cfg.discovery.exclude.clone(),
            settings: cfg.pipeline.clone(),
        }
    }
}

/// What one [`Discovery::sync`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// Pending triggers that were scheduled during this sync.
    pub triggered: Vec<(String, RunId)>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.triggered.is_empty()
    }
}

#[derive(Debug)]
pub struct Discovery {
    scheduler: Scheduler,
    options: DiscoveryOptions,
    filter: NameFilter,
    /// Pipeline names to schedule once, as soon as they are registered.
    pending_triggers: Vec<String>,
}

impl Discovery {
    pub fn new(scheduler: Scheduler, options: DiscoveryOptions) -> Result<Self> {
        let filter = NameFilter::new(&options.include, &options.exclude)?;
        Ok(Self {
            scheduler,
            options,
            filter,
            pending_triggers: Vec::new(),
        })
    }

    /// Schedule `name` once it has been discovered.
    pub fn trigger_when_available(&mut self, name: impl Into<String>) {
        self.pending_triggers.push(name.into());
    }

    pub fn pending_triggers(&self) -> &[String] {
        &self.pending_triggers
    }

    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    fn settings_for(&self, name: &str) -> PipelineSettings {
        self.options.settings.get(name).copied().unwrap_or_default()
    }

    /// Scan once and reconcile the registry.
    pub fn sync(&mut self) -> Result<SyncReport> {
        let found = scan_pipelines(&self.options.pipelines_dir, &self.filter)?;
        let mut report = SyncReport::default();

        let known: HashMap<PathBuf, Pipeline> = self
            .scheduler
            .pipelines()
            .into_iter()
            .map(|p| (p.exec_path.clone(), p))
            .collect();

        for binary in &found {
            let settings = self.settings_for(&binary.name);

            match known.get(&binary.path) {
                Some(existing) => {
                    let unchanged = existing.checksum == binary.checksum
                        && existing.concurrent == settings.concurrent
                        && existing.priority == settings.priority
                        && existing.name == binary.name;
                    if unchanged {
                        continue;
                    }
                    let mut updated = existing.clone();
                    updated.name = binary.name.clone();
                    updated.pipeline_type = binary.pipeline_type;
                    updated.checksum = binary.checksum.clone();
                    updated.concurrent = settings.concurrent;
                    updated.priority = settings.priority;
                    info!(pipeline = %updated.name, id = %updated.id, "pipeline binary changed");
                    self.scheduler.register_pipeline(updated)?;
                    report.updated.push(binary.name.clone());
                }
                None => {
                    if self.scheduler.pipeline_by_name(&binary.name).is_some() {
                        warn!(
                            pipeline = %binary.name,
                            path = ?binary.path,
                            "another binary already uses this pipeline name"
                        );
                    }
                    let id = self.scheduler.next_pipeline_id()?;
                    let pipeline = Pipeline::new(id, binary.name.clone(), binary.path.clone())
                        .with_type(binary.pipeline_type)
                        .with_checksum(binary.checksum.clone())
                        .with_concurrent(settings.concurrent)
                        .with_priority(settings.priority);
                    self.scheduler.register_pipeline(pipeline)?;
                    report.added.push(binary.name.clone());
                }
            }
        }

        for (path, pipeline) in &known {
            let still_there = found.iter().any(|b| &b.path == path);
            if !still_there && path.starts_with(&self.options.pipelines_dir) {
                info!(pipeline = %pipeline.name, path = ?path, "pipeline binary vanished");
                self.scheduler.remove_pipeline(pipeline.id)?;
                report.removed.push(pipeline.name.clone());
            }
        }

        self.fire_pending_triggers(&mut report);

        if !report.is_empty() {
            debug!(?report, "discovery sync applied changes");
        }
        Ok(report)
    }

    fn fire_pending_triggers(&mut self, report: &mut SyncReport) {
        let pending = std::mem::take(&mut self.pending_triggers);
        for name in pending {
            let Some(pipeline) = self.scheduler.pipeline_by_name(&name) else {
                self.pending_triggers.push(name);
                continue;
            };
            match self.scheduler.schedule(pipeline.id) {
                Ok(run_id) => {
                    info!(pipeline = %name, run_id, "triggered pipeline");
                    report.triggered.push((name, run_id));
                }
                Err(e) => warn!(pipeline = %name, error = %e, "could not trigger pipeline"),
            }
        }
    }
}
