// src/recovery/failure.rs

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::reference::{LOST_FIXED_OBJECT, RefId, WorkerId};

/// Reason string carried by a failure report and by `Error` references.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FailureReason {
    /// Worker unreachable or lost its heartbeat while the task was assigned.
    WorkerFailed,
    /// A dependency could not be fetched from its hinted locations.
    MissingInput,
    /// The task's own logic raised.
    RuntimeException,
    /// A `Fixed` input lost its only location.
    LostFixedObject,
    /// Explicit cancellation.
    Aborted,
    /// An input resolved to an error.
    DependencyFailed,
    Other(String),
}

impl FailureReason {
    pub fn as_str(&self) -> &str {
        match self {
            FailureReason::WorkerFailed => "WORKER_FAILED",
            FailureReason::MissingInput => "MISSING_INPUT",
            FailureReason::RuntimeException => "RUNTIME_EXCEPTION",
            FailureReason::LostFixedObject => LOST_FIXED_OBJECT,
            FailureReason::Aborted => "ABORTED",
            FailureReason::DependencyFailed => "DEPENDENCY_FAILED",
            FailureReason::Other(s) => s,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            FailureReason::WorkerFailed => FailureKind::TransientWorkerFailure,
            FailureReason::MissingInput => FailureKind::MissingInputFailure,
            _ => FailureKind::PermanentTaskFailure,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_uppercase().as_str() {
            "WORKER_FAILED" => FailureReason::WorkerFailed,
            "MISSING_INPUT" => FailureReason::MissingInput,
            "RUNTIME_EXCEPTION" => FailureReason::RuntimeException,
            "LOST_FIXED_OBJECT" => FailureReason::LostFixedObject,
            "ABORTED" => FailureReason::Aborted,
            "DEPENDENCY_FAILED" => FailureReason::DependencyFailed,
            _ => FailureReason::Other(s.to_string()),
        })
    }
}

impl From<String> for FailureReason {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(reason) => reason,
            Err(never) => match never {},
        }
    }
}

impl From<FailureReason> for String {
    fn from(reason: FailureReason) -> Self {
        reason.as_str().to_string()
    }
}

/// How the master reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retried up to the configured bound.
    TransientWorkerFailure,
    /// Heals by re-deriving lost inputs; never counted against the bound.
    MissingInputFailure,
    /// Never retried; errors are published to the task's outputs.
    PermanentTaskFailure,
}

/// One input a task could not fetch, and the locations it tried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedBinding {
    pub reference: RefId,
    #[serde(default)]
    pub locations: BTreeSet<WorkerId>,
}

/// What to do with a task after a `WORKER_FAILED` report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32 },
    GiveUp,
}

/// Bounded retry rule for transient worker failures.
///
/// `failures` is the number of worker failures seen so far, including the
/// one being handled; the task is retried while it stays below `max`.
pub fn retry_decision(failures: u32, max: u32) -> RetryDecision {
    if failures < max {
        RetryDecision::Retry {
            attempt: failures + 1,
        }
    } else {
        RetryDecision::GiveUp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_classify_by_kind() {
        assert_eq!(
            FailureReason::WorkerFailed.kind(),
            FailureKind::TransientWorkerFailure
        );
        assert_eq!(
            FailureReason::MissingInput.kind(),
            FailureKind::MissingInputFailure
        );
        assert_eq!(
            FailureReason::RuntimeException.kind(),
            FailureKind::PermanentTaskFailure
        );
        assert_eq!(
            FailureReason::from("SEGFAULT".to_string()).kind(),
            FailureKind::PermanentTaskFailure
        );
    }

    #[test]
    fn reason_strings_round_trip_through_json() {
        let json = serde_json::to_string(&FailureReason::WorkerFailed).unwrap();
        assert_eq!(json, r#""WORKER_FAILED""#);
        let back: FailureReason = serde_json::from_str(r#""missing_input""#).unwrap();
        assert_eq!(back, FailureReason::MissingInput);
    }

    #[test]
    fn third_worker_failure_gives_up() {
        assert_eq!(retry_decision(1, 3), RetryDecision::Retry { attempt: 2 });
        assert_eq!(retry_decision(2, 3), RetryDecision::Retry { attempt: 3 });
        assert_eq!(retry_decision(3, 3), RetryDecision::GiveUp);
    }
}
