// src/graph/mod.rs

//! Dynamic task graph of a job.
//!
//! - [`ref_table`] holds the current observed value of every reference, its
//!   producing task and its subscribers.
//! - [`dynamic`] implements `spawn`, `publish`, `subscribe` and the lazy
//!   backward reduction that activates only the tasks needed for the
//!   requested outputs.
//! - [`diagnostics`] finds dependency cycles among blocked tasks.

pub mod diagnostics;
pub mod dynamic;
pub mod ref_table;

pub use dynamic::{GraphDelta, TaskGraph};
pub use ref_table::{RefEntry, Subscriber};
