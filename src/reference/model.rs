// src/reference/model.rs

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reason attached to the `Error` produced when a `Fixed` reference loses its
/// only location.
pub const LOST_FIXED_OBJECT: &str = "LOST_FIXED_OBJECT";

/// Identity of a named unit of data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefId(pub String);

impl RefId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RefId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a worker. Location hints carried by references name workers
/// by this id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Observed state of a reference.
///
/// Exactly one current value exists per [`RefId`] inside a task graph; new
/// observations are folded in with [`super::combine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Unresolved promise.
    Future { id: RefId },
    /// Being produced now; consumable while still growing.
    Stream {
        id: RefId,
        hints: BTreeSet<WorkerId>,
    },
    /// A stream served directly from a socket on one worker.
    SocketStream {
        id: RefId,
        location: WorkerId,
        port: u16,
    },
    /// Finished and available at one or more workers.
    Concrete {
        id: RefId,
        size_hint: Option<u64>,
        hints: BTreeSet<WorkerId>,
    },
    /// A concrete reference with one preferred ("affine") location.
    Sweetheart {
        id: RefId,
        preferred: WorkerId,
        size_hint: Option<u64>,
        hints: BTreeSet<WorkerId>,
    },
    /// Must be read from exactly one worker.
    Fixed { id: RefId, location: WorkerId },
    /// Update asserting that the listed locations no longer hold the data.
    Tombstone {
        id: RefId,
        dead: BTreeSet<WorkerId>,
    },
    /// Succeeded, with no retrievable payload.
    Completed { id: RefId },
    /// Terminal failure marker.
    Error {
        id: RefId,
        reason: String,
        detail: Option<String>,
    },
    /// Payload small enough to travel inline.
    DataValue { id: RefId, value: Vec<u8> },
}

impl Reference {
    pub fn future(id: impl Into<String>) -> Self {
        Reference::Future { id: RefId::new(id) }
    }

    pub fn concrete<I, W>(id: impl Into<String>, size_hint: Option<u64>, hints: I) -> Self
    where
        I: IntoIterator<Item = W>,
        W: Into<String>,
    {
        Reference::Concrete {
            id: RefId::new(id),
            size_hint,
            hints: hints.into_iter().map(WorkerId::new).collect(),
        }
    }

    pub fn stream<I, W>(id: impl Into<String>, hints: I) -> Self
    where
        I: IntoIterator<Item = W>,
        W: Into<String>,
    {
        Reference::Stream {
            id: RefId::new(id),
            hints: hints.into_iter().map(WorkerId::new).collect(),
        }
    }

    pub fn tombstone<I, W>(id: impl Into<String>, dead: I) -> Self
    where
        I: IntoIterator<Item = W>,
        W: Into<String>,
    {
        Reference::Tombstone {
            id: RefId::new(id),
            dead: dead.into_iter().map(WorkerId::new).collect(),
        }
    }

    pub fn error(id: RefId, reason: impl Into<String>, detail: Option<String>) -> Self {
        Reference::Error {
            id,
            reason: reason.into(),
            detail,
        }
    }

    pub fn id(&self) -> &RefId {
        match self {
            Reference::Future { id }
            | Reference::Stream { id, .. }
            | Reference::SocketStream { id, .. }
            | Reference::Concrete { id, .. }
            | Reference::Sweetheart { id, .. }
            | Reference::Fixed { id, .. }
            | Reference::Tombstone { id, .. }
            | Reference::Completed { id }
            | Reference::Error { id, .. }
            | Reference::DataValue { id, .. } => id,
        }
    }

    /// Whether a task may bind this value as an input.
    ///
    /// `Fixed` counts as consumable: the consuming task is pinned to its
    /// location instead of waiting.
    pub fn is_consumable(&self) -> bool {
        matches!(
            self,
            Reference::DataValue { .. }
                | Reference::Concrete { .. }
                | Reference::Sweetheart { .. }
                | Reference::Completed { .. }
                | Reference::Stream { .. }
                | Reference::SocketStream { .. }
                | Reference::Fixed { .. }
        )
    }

    /// Still growing; subscriptions on it stay live until it resolves.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Reference::Stream { .. } | Reference::SocketStream { .. }
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reference::Error { .. })
    }

    pub fn is_future(&self) -> bool {
        matches!(self, Reference::Future { .. })
    }

    /// A final value: consumable and no longer streaming, or an error.
    pub fn is_terminal(&self) -> bool {
        (self.is_consumable() && !self.is_streaming()) || self.is_error()
    }

    pub fn size_hint(&self) -> Option<u64> {
        match self {
            Reference::Concrete { size_hint, .. } | Reference::Sweetheart { size_hint, .. } => {
                *size_hint
            }
            Reference::DataValue { value, .. } => Some(value.len() as u64),
            _ => None,
        }
    }

    /// Every worker this value can be read from.
    pub fn locations(&self) -> BTreeSet<WorkerId> {
        match self {
            Reference::Stream { hints, .. } | Reference::Concrete { hints, .. } => hints.clone(),
            Reference::Sweetheart {
                preferred, hints, ..
            } => {
                let mut all = hints.clone();
                all.insert(preferred.clone());
                all
            }
            Reference::Fixed { location, .. } | Reference::SocketStream { location, .. } => {
                BTreeSet::from([location.clone()])
            }
            _ => BTreeSet::new(),
        }
    }

    /// Short kind name used in logs and status output.
    pub fn kind(&self) -> &'static str {
        match self {
            Reference::Future { .. } => "future",
            Reference::Stream { .. } => "stream",
            Reference::SocketStream { .. } => "socket_stream",
            Reference::Concrete { .. } => "concrete",
            Reference::Sweetheart { .. } => "sweetheart",
            Reference::Fixed { .. } => "fixed",
            Reference::Tombstone { .. } => "tombstone",
            Reference::Completed { .. } => "completed",
            Reference::Error { .. } => "error",
            Reference::DataValue { .. } => "value",
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Error { id, reason, detail } => match detail {
                Some(d) => write!(f, "error({id}: {reason}: {d})"),
                None => write!(f, "error({id}: {reason})"),
            },
            other => write!(f, "{}({})", other.kind(), other.id()),
        }
    }
}
