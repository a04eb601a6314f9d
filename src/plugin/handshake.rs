// src/plugin/handshake.rs

//! The first line a plugin prints on stdout:
//!
//! ```text
//! <core>|<protocol>|<network>|<address>|<format>
//! 1|1|tcp|127.0.0.1:40123|jsonl
//! 1|1|unix|/tmp/plugin.sock|jsonl
//! 1|1|stdio|-|jsonl
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{ConveyorError, Result};

/// Version of the handshake format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Application protocol versions this host can speak.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[u32] = &[1];

/// Only framing the host speaks.
pub const WIRE_FORMAT: &str = "jsonl";

/// Environment variable set on every plugin child.
pub const COOKIE_KEY: &str = "CONVEYOR_PLUGIN_COOKIE";

/// Value of [`COOKIE_KEY`]. Plugins refuse to start without it, which keeps
/// them from being run by hand by accident.
pub const COOKIE_VALUE: &str = "a7f3c2e19b5d4f08";

static HANDSHAKE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\|(\d+)\|([A-Za-z]+)\|([^|]+)\|([A-Za-z0-9_-]+)$")
        .expect("handshake regex is valid")
});

/// Where the host reaches the plugin after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
    /// Requests go to the child's stdin, responses come from its stdout.
    Stdio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub core_version: u32,
    pub protocol_version: u32,
    pub endpoint: Endpoint,
}

impl FromStr for Handshake {
    type Err = ConveyorError;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let caps = HANDSHAKE_RE.captures(line).ok_or_else(|| {
            ConveyorError::PluginProtocolError(format!("malformed handshake line: {line:?}"))
        })?;

        let number = |idx: usize| -> Result<u32> {
            caps[idx].parse::<u32>().map_err(|e| {
                ConveyorError::PluginProtocolError(format!("bad version in handshake: {e}"))
            })
        };

        let core_version = number(1)?;
        if core_version != CORE_PROTOCOL_VERSION {
            return Err(ConveyorError::PluginVersionUnsupported(format!(
                "core protocol version {core_version}, host speaks {CORE_PROTOCOL_VERSION}"
            )));
        }

        let protocol_version = number(2)?;
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&protocol_version) {
            return Err(ConveyorError::PluginVersionUnsupported(format!(
                "plugin protocol version {protocol_version}, host supports {SUPPORTED_PROTOCOL_VERSIONS:?}"
            )));
        }

        let format = &caps[5];
        if format != WIRE_FORMAT {
            return Err(ConveyorError::PluginVersionUnsupported(format!(
                "wire format '{format}', host speaks '{WIRE_FORMAT}'"
            )));
        }

        let address = &caps[4];
        let endpoint = match &caps[3] {
            "tcp" => Endpoint::Tcp(address.to_string()),
            "unix" => Endpoint::Unix(PathBuf::from(address)),
            "stdio" => Endpoint::Stdio,
            other => {
                return Err(ConveyorError::PluginProtocolError(format!(
                    "unknown network type '{other}' in handshake"
                )));
            }
        };

        Ok(Handshake {
            core_version,
            protocol_version,
            endpoint,
        })
    }
}
