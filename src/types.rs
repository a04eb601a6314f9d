use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Toolchain a pipeline binary was built with.
///
/// Purely informational for the scheduler; every pipeline is executed the
/// same way once it is a binary speaking the plugin protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineType {
    Golang,
    Rust,
    Python,
    Java,
    Unknown,
}

impl Default for PipelineType {
    fn default() -> Self {
        PipelineType::Unknown
    }
}

impl PipelineType {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineType::Golang => "golang",
            PipelineType::Rust => "rust",
            PipelineType::Python => "python",
            PipelineType::Java => "java",
            PipelineType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PipelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "golang" | "go" => Ok(PipelineType::Golang),
            "rust" => Ok(PipelineType::Rust),
            "python" => Ok(PipelineType::Python),
            "java" => Ok(PipelineType::Java),
            other => Err(format!("unknown pipeline type: {other}")),
        }
    }
}

/// Why a run was asked to stop before finishing on its own.
///
/// - `User`: explicit abort; the run ends `Canceled`.
/// - `Shutdown`: the server is going down; queued runs end `Canceled`,
///   runs already executing end `Failed` because their outcome is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    User,
    Shutdown,
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
