// src/reference/combine.rs

//! The merge rule between two observations of the same reference.
//!
//! `combine` is total and order-sensitive. In particular it is not
//! commutative: an `Error` never overrides a resolved value, and a
//! `Tombstone` can downgrade a `Concrete` back to `Future` while nothing can
//! resurrect data a tombstone has removed except a fresh publication.

use std::collections::BTreeSet;

use super::model::{LOST_FIXED_OBJECT, Reference, WorkerId};

/// Fold `update` into `original`, returning the new observed value.
///
/// Pure: callers are responsible for notifying subscribers of the result.
/// Observations of different ids are never merged; `original` is returned.
pub fn combine(original: &Reference, update: &Reference) -> Reference {
    if original.id() != update.id() {
        return original.clone();
    }

    use Reference as R;

    match (original, update) {
        // Inline values are the most authoritative observation.
        (R::DataValue { .. }, _) => original.clone(),
        (_, R::DataValue { .. }) => update.clone(),

        (
            _,
            R::Sweetheart {
                id,
                preferred,
                size_hint,
                hints,
            },
        ) => {
            let (prev_size, prev_hints) = match original {
                R::Concrete {
                    size_hint, hints, ..
                }
                | R::Sweetheart {
                    size_hint, hints, ..
                } => (*size_hint, hints.clone()),
                _ => (None, BTreeSet::new()),
            };
            R::Sweetheart {
                id: id.clone(),
                preferred: preferred.clone(),
                size_hint: size_hint.or(prev_size),
                hints: union(&prev_hints, hints),
            }
        }

        (R::Concrete { id, size_hint, hints }, R::Tombstone { dead, .. }) => {
            let remaining = difference(hints, dead);
            if remaining.is_empty() {
                R::Future { id: id.clone() }
            } else {
                R::Concrete {
                    id: id.clone(),
                    size_hint: *size_hint,
                    hints: remaining,
                }
            }
        }
        (
            R::Sweetheart {
                id,
                preferred,
                size_hint,
                hints,
            },
            R::Tombstone { dead, .. },
        ) => {
            let remaining = difference(hints, dead);
            if !dead.contains(preferred) {
                R::Sweetheart {
                    id: id.clone(),
                    preferred: preferred.clone(),
                    size_hint: *size_hint,
                    hints: remaining,
                }
            } else if remaining.is_empty() {
                R::Future { id: id.clone() }
            } else {
                R::Concrete {
                    id: id.clone(),
                    size_hint: *size_hint,
                    hints: remaining,
                }
            }
        }
        (R::Stream { id, hints }, R::Tombstone { dead, .. }) => {
            let remaining = difference(hints, dead);
            if remaining.is_empty() {
                R::Future { id: id.clone() }
            } else {
                R::Stream {
                    id: id.clone(),
                    hints: remaining,
                }
            }
        }
        (R::SocketStream { id, location, .. }, R::Tombstone { dead, .. })
            if dead.contains(location) =>
        {
            R::Future { id: id.clone() }
        }
        (R::Fixed { id, location }, R::Tombstone { dead, .. }) if dead.contains(location) => {
            R::Error {
                id: id.clone(),
                reason: LOST_FIXED_OBJECT.to_string(),
                detail: Some(format!("fixed location {location} is gone")),
            }
        }
        (_, R::Tombstone { .. }) => original.clone(),

        (R::Future { .. } | R::Stream { .. } | R::SocketStream { .. }, R::Concrete { .. }) => {
            update.clone()
        }
        (
            R::Concrete {
                id,
                size_hint,
                hints,
            },
            R::Concrete {
                size_hint: new_size,
                hints: new_hints,
                ..
            },
        ) => R::Concrete {
            id: id.clone(),
            size_hint: size_hint.or(*new_size),
            hints: union(hints, new_hints),
        },
        (
            R::Sweetheart {
                id,
                preferred,
                size_hint,
                hints,
            },
            R::Concrete {
                size_hint: new_size,
                hints: new_hints,
                ..
            },
        ) => R::Sweetheart {
            id: id.clone(),
            preferred: preferred.clone(),
            size_hint: size_hint.or(*new_size),
            hints: union(hints, new_hints),
        },
        (_, R::Concrete { .. }) => original.clone(),

        (R::Future { .. } | R::Stream { .. } | R::SocketStream { .. }, R::Completed { .. }) => {
            update.clone()
        }
        (_, R::Completed { .. }) => original.clone(),

        (R::Future { .. }, R::Stream { .. }) => update.clone(),
        (R::Stream { id, hints }, R::Stream { hints: new_hints, .. }) => R::Stream {
            id: id.clone(),
            hints: union(hints, new_hints),
        },
        (_, R::Stream { .. }) => original.clone(),

        (R::Future { .. }, R::SocketStream { .. }) => update.clone(),
        (_, R::SocketStream { .. }) => original.clone(),

        (R::Future { .. }, R::Fixed { .. }) => update.clone(),
        (_, R::Fixed { .. }) => original.clone(),

        // An error only ever settles an unresolved promise.
        (R::Future { .. }, R::Error { .. }) => update.clone(),
        (_, R::Error { .. }) => original.clone(),

        (_, R::Future { .. }) => original.clone(),
    }
}

fn union(a: &BTreeSet<WorkerId>, b: &BTreeSet<WorkerId>) -> BTreeSet<WorkerId> {
    a.union(b).cloned().collect()
}

fn difference(a: &BTreeSet<WorkerId>, b: &BTreeSet<WorkerId>) -> BTreeSet<WorkerId> {
    a.difference(b).cloned().collect()
}
