// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::store::RetryPolicy;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [server]
/// home_path = "/var/lib/conveyor"
/// workers = 4
/// handshake_timeout = "10s"
/// job_timeout = "30m"
///
/// [discovery]
/// interval = "3s"
/// exclude = [".*", "*.tmp"]
///
/// [pipeline.deploy]
/// concurrent = false
/// priority = 10
/// ```
///
/// Every section is optional. Durations are strings with an `ms`, `s`, `m`
/// or `h` suffix and are only parsed during validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub server: RawServerSection,

    #[serde(default)]
    pub discovery: RawDiscoverySection,

    /// Per-pipeline overrides keyed by pipeline name.
    #[serde(default)]
    pub pipeline: BTreeMap<String, PipelineSettings>,
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawServerSection {
    /// Root for `data/`, `pipelines/` and `workspace/`.
    #[serde(default = "default_home_path")]
    pub home_path: PathBuf,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: String,

    /// No per-job limit when absent.
    #[serde(default)]
    pub job_timeout: Option<String>,

    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,

    #[serde(default = "default_store_retry_backoff")]
    pub store_retry_backoff: String,
}

/// Directory holding the running executable, or `.` if it cannot be found.
fn default_home_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_workers() -> usize {
    2
}

fn default_handshake_timeout() -> String {
    "10s".to_string()
}

fn default_store_retry_attempts() -> u32 {
    3
}

fn default_store_retry_backoff() -> String {
    "100ms".to_string()
}

impl Default for RawServerSection {
    fn default() -> Self {
        Self {
            home_path: default_home_path(),
            workers: default_workers(),
            handshake_timeout: default_handshake_timeout(),
            job_timeout: None,
            store_retry_attempts: default_store_retry_attempts(),
            store_retry_backoff: default_store_retry_backoff(),
        }
    }
}

/// `[discovery]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDiscoverySection {
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Rescan immediately on filesystem events in the pipelines folder.
    #[serde(default = "default_true")]
    pub watch: bool,

    /// File-name globs a binary must match. Empty means everything.
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

fn default_interval() -> String {
    "3s".to_string()
}

fn default_true() -> bool {
    true
}

fn default_exclude() -> Vec<String> {
    vec![".*".to_string(), "*.tmp".to_string()]
}

impl Default for RawDiscoverySection {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            watch: default_true(),
            include: Vec::new(),
            exclude: default_exclude(),
        }
    }
}

/// `[pipeline.<name>]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSettings {
    #[serde(default = "default_true")]
    pub concurrent: bool,

    /// Queue priority; higher runs are dequeued first.
    #[serde(default)]
    pub priority: i32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrent: true,
            priority: 0,
        }
    }
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub server: ServerConfig,
    pub discovery: DiscoveryConfig,
    pub pipeline: BTreeMap<String, PipelineSettings>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub home_path: PathBuf,
    pub workers: usize,
    pub handshake_timeout: Duration,
    pub job_timeout: Option<Duration>,
    pub store_retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub interval: Duration,
    pub watch: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl ConfigFile {
    /// Construct without validation; used by the `TryFrom` impl.
    pub(crate) fn new_unchecked(
        server: ServerConfig,
        discovery: DiscoveryConfig,
        pipeline: BTreeMap<String, PipelineSettings>,
    ) -> Self {
        Self {
            server,
            discovery,
            pipeline,
        }
    }

    /// Overrides for `name`, or the defaults.
    pub fn pipeline_settings(&self, name: &str) -> PipelineSettings {
        self.pipeline.get(name).copied().unwrap_or_default()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.server.home_path.join("data")
    }

    pub fn pipelines_dir(&self) -> PathBuf {
        self.server.home_path.join("pipelines")
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.server.home_path.join("workspace")
    }
}
