// src/errors.rs

//! Crate-wide error type and result alias.

use std::time::Duration;

use thiserror::Error;

use crate::domain::{PipelineId, RunId, RunStatus};

#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(PipelineId),

    #[error("Pipeline {0} does not allow concurrent runs and already has one active")]
    ConcurrencyLimit(PipelineId),

    #[error("Run {run} of pipeline {pipeline} not found")]
    RunNotFound { pipeline: PipelineId, run: RunId },

    #[error("Run queue is closed")]
    QueueClosed,

    #[error("Plugin did not complete its handshake within {0:?}")]
    PluginHandshakeTimeout(Duration),

    #[error("Plugin protocol error: {0}")]
    PluginProtocolError(String),

    #[error("Plugin crashed: {0}")]
    PluginCrashed(String),

    #[error("Plugin version unsupported: {0}")]
    PluginVersionUnsupported(String),

    #[error("Job '{job}' exceeded its timeout of {timeout:?}")]
    JobTimeout { job: String, timeout: Duration },

    #[error("Store write failed: {0}")]
    StoreWriteFailure(String),

    #[error("Invalid run status transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConveyorError {
    /// Whether this error came from talking to (or launching) a plugin.
    pub fn is_plugin_error(&self) -> bool {
        matches!(
            self,
            ConveyorError::PluginHandshakeTimeout(_)
                | ConveyorError::PluginProtocolError(_)
                | ConveyorError::PluginCrashed(_)
                | ConveyorError::PluginVersionUnsupported(_)
                | ConveyorError::JobTimeout { .. }
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ConveyorError>;
