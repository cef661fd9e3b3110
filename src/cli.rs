// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::types::PlacementPolicyKind;

/// Command-line arguments for `taskweave`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "taskweave",
    version,
    about = "Run a demand-driven task graph master with in-process workers.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Taskweave.toml` in the current working directory. A missing
    /// default file means built-in defaults.
    #[arg(long, value_name = "PATH", default_value = "Taskweave.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TASKWEAVE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate the config, print it, but don't start the master.
    #[arg(long)]
    pub dry_run: bool,

    /// Submit the root task descriptor in this JSON file, print the job's
    /// result and exit.
    #[arg(long, value_name = "FILE")]
    pub submit: Option<PathBuf>,

    /// Placement policy for the submitted job (defaults to the config's).
    #[arg(long, value_name = "POLICY")]
    pub policy: Option<PlacementPolicyKind>,

    /// Seconds to wait for a submitted job before giving up.
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub timeout: u64,

    /// Replay job journals from `[master].journal_dir` at startup.
    #[arg(long)]
    pub recover: bool,
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
