// src/discovery/scan.rs

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};

use crate::discovery::checksum::compute_file_hash;
use crate::errors::{ConveyorError, Result};
use crate::types::PipelineType;

/// Compiled include/exclude file-name globs.
#[derive(Clone)]
pub struct NameFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl fmt::Debug for NameFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NameFilter")
            .field("include", &self.include.as_ref().map(GlobSet::len))
            .field("exclude", &self.exclude.as_ref().map(GlobSet::len))
            .finish()
    }
}

impl NameFilter {
    /// An empty include list accepts every name.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: build_globset(include)?,
            exclude: build_globset(exclude)?,
        })
    }

    pub fn matches(&self, file_name: &str) -> bool {
        if let Some(include) = &self.include {
            if !include.is_match(file_name) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(file_name) {
                return false;
            }
        }
        true
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = Glob::new(pat)
            .map_err(|e| ConveyorError::ConfigError(format!("invalid glob pattern '{pat}': {e}")))?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| ConveyorError::ConfigError(format!("building glob set: {e}")))?;
    Ok(Some(set))
}

/// A pipeline binary found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredBinary {
    pub name: String,
    pub pipeline_type: PipelineType,
    pub path: PathBuf,
    pub checksum: String,
}

/// Split `<name>_<type>` into its parts.
///
/// `build_golang` → (`build`, golang). Names without a known type suffix are
/// kept whole with type `unknown`.
pub fn parse_binary_name(file_name: &str) -> (String, PipelineType) {
    if let Some((name, suffix)) = file_name.rsplit_once('_') {
        if !name.is_empty() {
            if let Ok(kind) = suffix.parse::<PipelineType>() {
                return (name.to_string(), kind);
            }
        }
    }
    (file_name.to_string(), PipelineType::Unknown)
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    true
}

/// List executable regular files directly under `dir`, sorted by path.
///
/// A missing directory yields an empty list. Files that vanish or cannot be
/// read mid-scan are skipped with a warning.
pub fn scan_pipelines(dir: &Path, filter: &NameFilter) -> Result<Vec<DiscoveredBinary>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = ?dir, "pipelines folder does not exist yet");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();

        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !filter.matches(file_name) {
            continue;
        }

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = ?path, error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !meta.is_file() || !is_executable(&meta) {
            continue;
        }

        let checksum = match compute_file_hash(&path) {
            Ok(sum) => sum,
            Err(e) => {
                warn!(path = ?path, error = %e, "skipping binary that could not be hashed");
                continue;
            }
        };

        let (name, pipeline_type) = parse_binary_name(file_name);
        found.push(DiscoveredBinary {
            name,
            pipeline_type,
            path,
            checksum,
        });
    }

    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}
