// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// `Taskweave.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Taskweave.toml")
}

/// Deserialize config text. No semantic checks.
pub fn parse_raw(contents: &str) -> Result<RawConfigFile> {
    Ok(toml::from_str(contents)?)
}

/// Read and deserialize the file at `path`.
///
/// Unknown keys are rejected here; durations, ranges and worker tables are
/// only checked by [`load_and_validate`].
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    parse_raw(&contents)
}

/// Read, deserialize and validate the file at `path`.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    ConfigFile::try_from(load_from_path(path)?)
}

/// Like [`load_and_validate`], except that a missing file at the default
/// path yields the built-in defaults. A missing explicit path is still an
/// error.
pub fn load_or_default(path: &Path) -> Result<ConfigFile> {
    if !path.exists() && path == default_config_path() {
        info!(path = %path.display(), "no config file; using defaults");
        return Ok(ConfigFile::default());
    }
    load_and_validate(path)
}
