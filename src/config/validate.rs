// src/config/validate.rs

use std::time::Duration;

use globset::Glob;

use crate::config::model::{
    ConfigFile, DiscoveryConfig, RawConfigFile, RawDiscoverySection, RawServerSection,
    ServerConfig,
};
use crate::errors::{ConveyorError, Result};
use crate::store::RetryPolicy;
use crate::types::parse_duration;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = ConveyorError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let server = validate_server(&raw.server)?;
        let discovery = validate_discovery(&raw.discovery)?;
        validate_pipeline_names(&raw)?;
        Ok(ConfigFile::new_unchecked(server, discovery, raw.pipeline))
    }
}

fn duration_field(section: &str, field: &str, value: &str) -> Result<Duration> {
    parse_duration(value)
        .map_err(|e| ConveyorError::ConfigError(format!("[{section}].{field}: {e}")))
}

fn validate_server(raw: &RawServerSection) -> Result<ServerConfig> {
    if raw.workers == 0 {
        return Err(ConveyorError::ConfigError(
            "[server].workers must be >= 1 (got 0)".to_string(),
        ));
    }
    if raw.store_retry_attempts == 0 {
        return Err(ConveyorError::ConfigError(
            "[server].store_retry_attempts must be >= 1 (got 0)".to_string(),
        ));
    }

    let handshake_timeout = duration_field("server", "handshake_timeout", &raw.handshake_timeout)?;
    if handshake_timeout.is_zero() {
        return Err(ConveyorError::ConfigError(
            "[server].handshake_timeout must be greater than zero".to_string(),
        ));
    }

    let job_timeout = raw
        .job_timeout
        .as_deref()
        .map(|s| duration_field("server", "job_timeout", s))
        .transpose()?;

    let backoff = duration_field("server", "store_retry_backoff", &raw.store_retry_backoff)?;

    Ok(ServerConfig {
        home_path: raw.home_path.clone(),
        workers: raw.workers,
        handshake_timeout,
        job_timeout,
        store_retry: RetryPolicy {
            attempts: raw.store_retry_attempts,
            initial_backoff: backoff,
            ..RetryPolicy::default()
        },
    })
}

fn validate_discovery(raw: &RawDiscoverySection) -> Result<DiscoveryConfig> {
    let interval = duration_field("discovery", "interval", &raw.interval)?;
    if interval.is_zero() {
        return Err(ConveyorError::ConfigError(
            "[discovery].interval must be greater than zero".to_string(),
        ));
    }

    for pattern in raw.include.iter().chain(raw.exclude.iter()) {
        Glob::new(pattern).map_err(|e| {
            ConveyorError::ConfigError(format!("[discovery] invalid glob '{pattern}': {e}"))
        })?;
    }

    Ok(DiscoveryConfig {
        interval,
        watch: raw.watch,
        include: raw.include.clone(),
        exclude: raw.exclude.clone(),
    })
}

fn validate_pipeline_names(raw: &RawConfigFile) -> Result<()> {
    for name in raw.pipeline.keys() {
        if name.trim().is_empty() {
            return Err(ConveyorError::ConfigError(
                "[pipeline.<name>] sections need a non-empty name".to_string(),
            ));
        }
    }
    Ok(())
}
