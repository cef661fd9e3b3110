// src/config/mod.rs

//! Configuration loading and validation for taskweave.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate settings and convert them into `MasterSettings` (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, load_or_default, parse_raw};
pub use model::{ConfigFile, MasterSection, RawConfigFile};
pub use validate::parse_duration;
