// src/engine/mod.rs

//! The master.
//!
//! The pure core state machine lives in [`core`] and the failure / commit
//! logic it applies in [`event_handlers`]; neither touches tokio. The async
//! shell in [`runtime`] feeds [`MasterEvent`]s into the core and executes the
//! [`CoreCommand`]s it returns. [`handle`] is the client side of the event
//! channel.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::errors::Result;
use crate::recovery::{FailedBinding, FailureReason};
use crate::reference::{Reference, WorkerId};
use crate::sched::{LocalitySettings, LotterySettings, WorkerSpec};
use crate::task::{JobId, JobStatus, TaskDescriptor, TaskId, TaskStatus};
use crate::types::PlacementPolicyKind;

/// Settings of the master core and its shell.
#[derive(Debug, Clone)]
pub struct MasterSettings {
    /// `WORKER_FAILED` reports tolerated before a task fails permanently.
    pub max_worker_failures: u32,
    pub heartbeat_timeout: Duration,
    pub heartbeat_check_interval: Duration,
    pub default_policy: PlacementPolicyKind,
    /// Journaling is enabled when set.
    pub journal_dir: Option<PathBuf>,
    pub rng_seed: Option<u64>,
    pub locality: LocalitySettings,
    pub lottery: LotterySettings,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            max_worker_failures: 3,
            heartbeat_timeout: Duration::from_secs(30),
            heartbeat_check_interval: Duration::from_secs(5),
            default_policy: PlacementPolicyKind::Locality,
            journal_dir: None,
            rng_seed: None,
            locality: LocalitySettings::default(),
            lottery: LotterySettings::default(),
        }
    }
}

/// How a task run ended, as reported by its worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Committed {
        #[serde(default)]
        spawned: Vec<TaskDescriptor>,
        #[serde(default)]
        published: Vec<Reference>,
    },
    Failed {
        reason: FailureReason,
        #[serde(default)]
        detail: Option<String>,
        #[serde(default)]
        failed_bindings: Vec<FailedBinding>,
    },
}

/// Atomic completion batch for one task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub job: JobId,
    pub task: TaskId,
    pub worker: WorkerId,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

/// Result of a location probe after a `MISSING_INPUT` report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub job: JobId,
    pub task: TaskId,
    pub reference: crate::reference::RefId,
    pub worker: WorkerId,
    /// The worker answered and still holds the data.
    pub present: bool,
}

pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests flowing into the master runtime.
#[derive(Debug)]
pub enum MasterEvent {
    SubmitJob {
        root: TaskDescriptor,
        policy: Option<PlacementPolicyKind>,
        reply: Reply<JobId>,
    },
    ReportCompletion {
        report: CompletionReport,
        reply: Reply<()>,
    },
    /// Out-of-band publication of references into a job.
    Publish {
        job: JobId,
        references: Vec<Reference>,
        reply: Reply<()>,
    },
    RegisterWorker {
        spec: WorkerSpec,
        reply: Reply<()>,
    },
    Heartbeat {
        worker: WorkerId,
        reply: Reply<()>,
    },
    DeregisterWorker {
        worker: WorkerId,
        reply: Reply<()>,
    },
    AbortTask {
        job: JobId,
        task: TaskId,
        reply: Reply<()>,
    },
    AbortJob {
        job: JobId,
        reply: Reply<()>,
    },
    JobStatus {
        job: JobId,
        reply: Reply<JobStatus>,
    },
    TaskStatus {
        job: JobId,
        task: TaskId,
        reply: Reply<TaskStatus>,
    },
    /// Answered once the job has finished.
    WaitResult {
        job: JobId,
        reply: Reply<Reference>,
    },
    ProbeCompleted(ProbeResult),
    ShutdownRequested,
}

pub mod core;
pub mod event_handlers;
pub mod handle;
pub mod runtime;

pub use core::CoreMaster;
pub use event_handlers::{CoreCommand, CoreStep};
pub use handle::MasterHandle;
pub use runtime::Runtime;
