// src/task/job.rs

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::errors::{Result, TaskweaveError};
use crate::graph::{Subscriber, TaskGraph};
use crate::reference::{RefId, Reference};
use crate::sched::lottery::{Ewma, tickets};
use crate::sched::policy::PlacementPolicy;
use crate::sched::queues::JobQueues;
use crate::types::PlacementPolicyKind;

use super::task_info::{TaskDescriptor, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id for a submitted job.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Running,
    Committed,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobState::Running)
    }
}

/// A root task and everything it caused to exist.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub root: TaskId,
    /// First expected output of the root task; its value is the job's result.
    pub result: RefId,
    pub state: JobState,
    pub graph: TaskGraph,
    pub created_at: Instant,
    pub finished_at: Option<Instant>,
    /// Tasks made runnable since the last scheduling pass.
    pub(crate) pending: Vec<TaskId>,
    pub(crate) queues: JobQueues,
    pub(crate) policy: Box<dyn PlacementPolicy>,
    pub(crate) durations: Ewma,
}

impl Job {
    /// Register the root task and subscribe to the job's result.
    ///
    /// The graph is not reduced yet; callers decide when to ask for the
    /// result.
    pub fn new(
        id: JobId,
        root: &TaskDescriptor,
        policy: Box<dyn PlacementPolicy>,
        ewma_alpha: f64,
        clock: SharedClock,
    ) -> Result<Self> {
        let result = root.expected_outputs.first().cloned().ok_or_else(|| {
            TaskweaveError::InvalidTask(format!(
                "root task '{}' must declare at least one expected output",
                root.task_id
            ))
        })?;

        let created_at = clock.now();
        let mut graph = TaskGraph::new(clock);
        graph.spawn(root, None)?;
        // The root is dormant, so this only registers interest.
        graph.subscribe(&result, Subscriber::External);

        Ok(Self {
            id,
            root: root.task_id.clone(),
            result,
            state: JobState::Running,
            graph,
            created_at,
            finished_at: None,
            pending: Vec::new(),
            queues: JobQueues::default(),
            policy,
            durations: Ewma::new(ewma_alpha),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn policy_kind(&self) -> PlacementPolicyKind {
        self.policy.kind()
    }

    pub fn tickets(&self, budget: f64) -> u64 {
        tickets(&self.durations, budget)
    }

    pub fn record_duration(&mut self, millis: f64) {
        self.durations.observe(millis);
    }

    /// The result value once the job has finished.
    pub fn result_value(&self) -> Option<&Reference> {
        if !self.state.is_finished() {
            return None;
        }
        self.graph.reference(&self.result)
    }

    /// Number of tasks per state name.
    pub fn state_counts(&self) -> BTreeMap<String, usize> {
        self.graph
            .state_counts()
            .into_iter()
            .map(|(state, n)| (state.name().to_string(), n))
            .collect()
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id.clone(),
            state: self.state,
            root: self.root.clone(),
            result: self.result.clone(),
            result_value: self.graph.reference(&self.result).cloned(),
            task_counts: self.state_counts(),
            blocked_cycle: self.graph.blocked_cycle(),
            policy: self.policy_kind(),
        }
    }
}

/// Read-only snapshot of a job for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    pub root: TaskId,
    pub result: RefId,
    pub result_value: Option<Reference>,
    pub task_counts: BTreeMap<String, usize>,
    /// Blocked tasks waiting on each other, if any.
    pub blocked_cycle: Option<Vec<TaskId>>,
    pub policy: PlacementPolicyKind,
}
