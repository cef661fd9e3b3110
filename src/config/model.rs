// src/config/model.rs

use std::path::PathBuf;

use serde::Deserialize;

use crate::engine::MasterSettings;
use crate::sched::{LocalitySettings, LotterySettings, WorkerSpec};
use crate::types::PlacementPolicyKind;

/// Configuration exactly as read from a TOML file.
///
/// ```toml
/// [master]
/// max_worker_failures = 3
/// heartbeat_timeout = "30s"
/// default_policy = "locality"
///
/// [locality]
/// margin = 0.9
///
/// [lottery]
/// ewma_alpha = 0.3
///
/// [[worker]]
/// id = "w1"
/// location = "127.0.0.1:9001"
/// handlers = ["const", "concat"]
/// capacity = { default = 2 }
/// ```
///
/// All sections are optional and have reasonable defaults. Durations are
/// still strings here; they are parsed during validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub master: MasterSection,

    #[serde(default)]
    pub locality: LocalitySettings,

    #[serde(default)]
    pub lottery: LotterySettings,

    /// Static workers run in-process by the local backend.
    #[serde(default, rename = "worker")]
    pub workers: Vec<WorkerSpec>,
}

/// `[master]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterSection {
    /// `WORKER_FAILED` attempts before a task fails permanently.
    #[serde(default = "default_max_worker_failures")]
    pub max_worker_failures: u32,

    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: String,

    #[serde(default = "default_heartbeat_check_interval")]
    pub heartbeat_check_interval: String,

    #[serde(default)]
    pub default_policy: PlacementPolicyKind,

    /// Enables journaling (and `--recover`) when set.
    #[serde(default)]
    pub journal_dir: Option<PathBuf>,

    #[serde(default)]
    pub rng_seed: Option<u64>,

    /// Outputs of local tasks up to this many bytes are published inline.
    #[serde(default = "default_inline_limit")]
    pub local_blob_inline_limit: usize,
}

fn default_max_worker_failures() -> u32 {
    3
}

fn default_heartbeat_timeout() -> String {
    "30s".to_string()
}

fn default_heartbeat_check_interval() -> String {
    "5s".to_string()
}

fn default_inline_limit() -> usize {
    1024
}

impl Default for MasterSection {
    fn default() -> Self {
        Self {
            max_worker_failures: default_max_worker_failures(),
            heartbeat_timeout: default_heartbeat_timeout(),
            heartbeat_check_interval: default_heartbeat_check_interval(),
            default_policy: PlacementPolicyKind::default(),
            journal_dir: None,
            rng_seed: None,
            local_blob_inline_limit: default_inline_limit(),
        }
    }
}

/// Validated configuration.
///
/// Only obtainable through `ConfigFile::try_from(RawConfigFile)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub master: MasterSettings,
    pub local_blob_inline_limit: usize,
    pub workers: Vec<WorkerSpec>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        master: MasterSettings,
        local_blob_inline_limit: usize,
        workers: Vec<WorkerSpec>,
    ) -> Self {
        Self {
            master,
            local_blob_inline_limit,
            workers,
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::new_unchecked(MasterSettings::default(), default_inline_limit(), Vec::new())
    }
}
