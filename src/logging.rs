// src/logging.rs

//! Logging setup for `conveyor` using `tracing` + `tracing-subscriber`.
//!
//! The filter comes from, in order:
//! 1. `--log-level` CLI flag (a single level for everything)
//! 2. `CONVEYOR_LOG`, read as `EnvFilter` directives, e.g.
//!    `info,conveyor::plugin::stderr=debug` to see what plugins print
//! 3. `info`
//!
//! Logs go to STDERR; stdout is reserved for `--dry-run` output.

use anyhow::Result;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

/// Environment variable consulted when no `--log-level` is given.
pub const LOG_ENV_VAR: &str = "CONVEYOR_LOG";

/// Target for lines a plugin child writes to its stderr.
pub const PLUGIN_STDERR_TARGET: &str = "conveyor::plugin::stderr";

const DEFAULT_DIRECTIVES: &str = "info";

/// Initialise the global subscriber. Call once at startup.
///
/// An unparsable `CONVEYOR_LOG` does not abort startup; the default filter
/// is used and a warning is logged.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env = std::env::var(LOG_ENV_VAR).ok();
    let (filter, rejected) = match build_filter(cli_level, env.as_deref()) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(DEFAULT_DIRECTIVES), Some(e)),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .init();

    if let Some(e) = rejected {
        warn!(var = LOG_ENV_VAR, value = ?env, error = %e, "ignoring invalid log filter");
    }
    Ok(())
}

fn build_filter(
    cli_level: Option<LogLevel>,
    env: Option<&str>,
) -> std::result::Result<EnvFilter, ParseError> {
    if let Some(level) = cli_level {
        return EnvFilter::try_new(level_directive(level));
    }
    match env.map(str::trim).filter(|s| !s.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives),
        None => EnvFilter::try_new(DEFAULT_DIRECTIVES),
    }
}

fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    fn max_level(filter: EnvFilter) -> Option<LevelFilter> {
        filter.max_level_hint()
    }

    #[test]
    fn cli_flag_wins_over_environment() {
        let filter = build_filter(Some(LogLevel::Trace), Some("warn")).unwrap();
        assert_eq!(max_level(filter), Some(LevelFilter::TRACE));
    }

    #[test]
    fn environment_accepts_per_target_directives() {
        let filter =
            build_filter(None, Some("warn,conveyor::plugin::stderr=debug")).unwrap();
        assert_eq!(max_level(filter), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn blank_environment_means_info() {
        let filter = build_filter(None, Some("  ")).unwrap();
        assert_eq!(max_level(filter), Some(LevelFilter::INFO));
        assert!(build_filter(None, Some("conveyor=loud")).is_err());
    }
}
