// src/recovery/mod.rs

//! Failure classification, retry bounds and the job journal.
//!
//! The decisions about *what* happens to a task after a failure report live
//! in [`crate::engine::event_handlers`]; this module holds the vocabulary
//! they use and the on-disk journal that lets a restarted master rebuild
//! its jobs.

pub mod failure;
pub mod journal;

pub use failure::{FailedBinding, FailureKind, FailureReason, RetryDecision, retry_decision};
pub use journal::{JournalRecord, JournalWriter, recover_all};
