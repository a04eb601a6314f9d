// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod discovery;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod plugin;
pub mod store;
pub mod types;

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::config::loader::load_or_default;
use crate::config::model::ConfigFile;
use crate::discovery::{Discovery, DiscoveryOptions, NameFilter, scan_pipelines, spawn_discovery};
use crate::engine::{Scheduler, SchedulerOptions};
use crate::plugin::{ConnectorOptions, ProcessConnector};
use crate::store::FileStore;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading (+ CLI overrides)
/// - file-backed store
/// - plugin connector and scheduler / worker pool
/// - pipeline discovery
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let mut cfg = load_or_default(args.config.as_deref())?;
    apply_overrides(&mut cfg, &args);

    if args.dry_run {
        return print_dry_run(&cfg);
    }

    fs::create_dir_all(&cfg.server.home_path)
        .with_context(|| format!("creating home directory {:?}", cfg.server.home_path))?;
    // Plugin children run inside `workspace/`, so every path handed to them
    // has to be absolute.
    cfg.server.home_path = fs::canonicalize(&cfg.server.home_path)?;
    for dir in [cfg.data_dir(), cfg.pipelines_dir(), cfg.workspace_dir()] {
        fs::create_dir_all(&dir).with_context(|| format!("creating {dir:?}"))?;
    }
    info!(home = ?cfg.server.home_path, workers = cfg.server.workers, "starting conveyor");

    let store = Arc::new(FileStore::open(cfg.data_dir())?);
    let connector = Arc::new(ProcessConnector::new(ConnectorOptions {
        handshake_timeout: cfg.server.handshake_timeout,
        workspace_dir: Some(cfg.workspace_dir()),
        ..ConnectorOptions::default()
    }));

    let scheduler = Scheduler::new(
        store,
        connector,
        SchedulerOptions {
            workers: cfg.server.workers,
            job_timeout: cfg.server.job_timeout,
            store_retry: cfg.server.store_retry,
        },
    )?;
    scheduler.init()?;

    let mut discovery = Discovery::new(scheduler.clone(), DiscoveryOptions::from_config(&cfg))?;
    for name in &args.triggers {
        discovery.trigger_when_available(name.clone());
    }
    let discovery_handle = spawn_discovery(discovery)?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("shutdown requested");

    discovery_handle.stop().await;
    scheduler.shutdown().await;

    info!("conveyor stopped");
    Ok(())
}

fn apply_overrides(cfg: &mut ConfigFile, args: &CliArgs) {
    if let Some(home) = &args.home {
        cfg.server.home_path = home.clone();
    }
    if let Some(workers) = args.workers {
        cfg.server.workers = workers.max(1);
    }
}

/// Print the effective settings and the pipelines discovery would register.
fn print_dry_run(cfg: &ConfigFile) -> Result<()> {
    println!("conveyor dry-run");
    println!("  server.home_path = {}", cfg.server.home_path.display());
    println!("  server.workers = {}", cfg.server.workers);
    println!("  server.handshake_timeout = {:?}", cfg.server.handshake_timeout);
    if let Some(timeout) = cfg.server.job_timeout {
        println!("  server.job_timeout = {timeout:?}");
    }
    println!("  discovery.interval = {:?}", cfg.discovery.interval);
    println!();

    let filter = NameFilter::new(&cfg.discovery.include, &cfg.discovery.exclude)?;
    let found = scan_pipelines(&cfg.pipelines_dir(), &filter)?;

    println!("pipelines ({}):", found.len());
    for binary in &found {
        let settings = cfg.pipeline_settings(&binary.name);
        println!("  - {} ({})", binary.name, binary.pipeline_type);
        println!("      path: {}", binary.path.display());
        println!("      checksum: {}", binary.checksum);
        if !settings.concurrent {
            println!("      concurrent: false");
        }
        if settings.priority != 0 {
            println!("      priority: {}", settings.priority);
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
