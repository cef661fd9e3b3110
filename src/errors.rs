// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::reference::{RefId, WorkerId};
use crate::task::{JobId, TaskId};

#[derive(Error, Debug)]
pub enum TaskweaveError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Unknown reference: {0}")]
    UnknownReference(RefId),

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    #[error("Unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("Invalid task descriptor: {0}")]
    InvalidTask(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("master runtime is not running")]
    RuntimeClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskweaveError {
    /// A request named a task, reference or job the master does not know.
    ///
    /// These are usage errors: surfaced immediately, never retried.
    pub fn is_consistency_error(&self) -> bool {
        matches!(
            self,
            TaskweaveError::UnknownReference(_)
                | TaskweaveError::UnknownTask(_)
                | TaskweaveError::UnknownJob(_)
                | TaskweaveError::UnknownWorker(_)
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, TaskweaveError>;
