// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `conveyor`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "conveyor",
    version,
    about = "Self-hosted pipeline automation server: discovers pipeline binaries and runs them.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// When omitted, `Conveyor.toml` in the current working directory is used
    /// if present, otherwise built-in defaults.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Home directory (`data/`, `pipelines/`, `workspace/`); overrides
    /// `[server].home_path`.
    #[arg(long, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Number of worker slots; overrides `[server].workers`.
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CONVEYOR_LOG` filter directives or `info` are used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Schedule a run of this pipeline once it has been discovered.
    /// May be given several times.
    #[arg(long = "trigger", value_name = "NAME")]
    pub triggers: Vec<String>,

    /// Scan the pipelines folder, print what would be registered and exit.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
