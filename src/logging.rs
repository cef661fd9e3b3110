// src/logging.rs

//! `tracing` subscriber for the `taskweave` binary.
//!
//! The filter comes from, in order:
//! 1. `--log-level`, applied to every target;
//! 2. `TASKWEAVE_LOG`, taken as `EnvFilter` directives, so
//!    `TASKWEAVE_LOG=info,taskweave::sched=trace` turns on placement traces
//!    alone;
//! 3. `info`.
//!
//! Output goes to stderr; stdout is reserved for job results.

use anyhow::{Result, anyhow};
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "TASKWEAVE_LOG";

const DEFAULT_DIRECTIVES: &str = "info";

/// Install the global subscriber. Fails if one is already installed.
///
/// Unparsable `TASKWEAVE_LOG` directives fall back to `info` with a warning
/// rather than stopping the master.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let (filter, rejected) = build_filter(cli_level, std::env::var(LOG_ENV).ok());

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {e}"))?;

    if let Some((directives, error)) = rejected {
        warn!(%directives, %error, "ignoring invalid {LOG_ENV}");
    }
    Ok(())
}

/// The filter to install, plus the env directives that were rejected, if any.
fn build_filter(
    cli_level: Option<LogLevel>,
    env: Option<String>,
) -> (EnvFilter, Option<(String, String)>) {
    let directives = match (cli_level, env) {
        (Some(level), _) => level_directive(level).to_string(),
        (None, Some(env)) if !env.trim().is_empty() => env,
        _ => DEFAULT_DIRECTIVES.to_string(),
    };

    match EnvFilter::try_new(&directives) {
        Ok(filter) => (filter, None),
        Err(e) => (
            EnvFilter::new(DEFAULT_DIRECTIVES),
            Some((directives, e.to_string())),
        ),
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
