// src/reference/mod.rs

//! References: named, evolving descriptions of where (or whether) a piece of
//! data exists.
//!
//! - [`model`] defines the identifiers and the [`Reference`] sum type.
//! - [`combine`] is the monotone merge rule folding a new observation into
//!   the current one.
//! - [`wire`] encodes references as tagged tuples (`["c2", id, size, hints]`).

pub mod combine;
pub mod model;
pub mod wire;

pub use combine::combine;
pub use model::{LOST_FIXED_OBJECT, RefId, Reference, WorkerId};
