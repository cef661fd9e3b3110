// src/task/task_info.rs

//! Unit-of-work records and their state machine.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TaskweaveError};
use crate::recovery::FailureReason;
use crate::reference::{RefId, Reference, WorkerId};
use crate::types::DEFAULT_SCHEDULING_CLASS;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task as submitted by a client or spawned by a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub handler: String,
    /// Local name -> reference. References may be futures whose producers
    /// are not known yet.
    #[serde(default)]
    pub dependencies: BTreeMap<String, Reference>,
    /// Ids this task promises to publish, in order.
    #[serde(default)]
    pub expected_outputs: Vec<RefId>,
    /// Opaque payload interpreted by the executor.
    #[serde(default)]
    pub task_private: Option<Reference>,
    #[serde(default)]
    pub scheduling_class: Option<String>,
}

impl TaskDescriptor {
    /// Structural checks applied before a descriptor enters a graph.
    pub fn validate(&self) -> Result<()> {
        if self.task_id.0.trim().is_empty() {
            return Err(TaskweaveError::InvalidTask("task id is empty".to_string()));
        }
        if self.handler.trim().is_empty() {
            return Err(TaskweaveError::InvalidTask(format!(
                "task '{}' has no handler",
                self.task_id
            )));
        }

        let mut seen = HashSet::new();
        for out in &self.expected_outputs {
            if !seen.insert(out) {
                return Err(TaskweaveError::InvalidTask(format!(
                    "task '{}' lists output '{}' twice",
                    self.task_id, out
                )));
            }
        }

        for (name, dep) in &self.dependencies {
            if seen.contains(dep.id()) {
                return Err(TaskweaveError::InvalidTask(format!(
                    "task '{}' depends on its own output '{}' (as '{}')",
                    self.task_id,
                    dep.id(),
                    name
                )));
            }
        }

        Ok(())
    }
}

/// Lifecycle of a task incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Blocking,
    Runnable,
    Queued,
    QueuedStreaming,
    Assigned,
    Committed,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Created => "CREATED",
            TaskState::Blocking => "BLOCKING",
            TaskState::Runnable => "RUNNABLE",
            TaskState::Queued => "QUEUED",
            TaskState::QueuedStreaming => "QUEUED_STREAMING",
            TaskState::Assigned => "ASSIGNED",
            TaskState::Committed => "COMMITTED",
            TaskState::Failed => "FAILED",
            TaskState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Entry in a task's diagnostic history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Created,
    Blocked { waiting_on: usize },
    Runnable,
    Queued { candidates: usize },
    Assigned { worker: WorkerId },
    Committed,
    Failed { reason: String },
    Retrying { attempt: u32 },
    AwaitingProbes { probes: usize },
    /// Re-reduced after lost inputs were accounted for.
    Restarted,
    Aborted,
}

/// Why a task ended up permanently failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub reason: FailureReason,
    pub detail: Option<String>,
}

/// A unit of work inside a job's task graph.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub handler: String,
    /// Local name -> reference id; values are bound lazily by reduction.
    pub dependencies: BTreeMap<String, RefId>,
    pub expected_outputs: Vec<RefId>,
    pub private: Option<Reference>,
    pub scheduling_class: String,
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub state: TaskState,
    pub assigned_worker: Option<WorkerId>,
    pub retry_count: u32,
    pub history: Vec<(Instant, TaskEvent)>,
    pub failure: Option<TaskFailure>,

    /// Inputs bound so far, keyed by reference id.
    pub(crate) inputs: BTreeMap<RefId, Reference>,
    /// Dependencies that are not consumable yet.
    pub(crate) unresolved: BTreeSet<RefId>,
    /// Bound inputs that are still streams.
    pub(crate) unfinished_streams: BTreeSet<RefId>,
    /// Reduction pass that last visited this task.
    pub(crate) reduce_epoch: u64,
    pub(crate) assigned_at: Option<Instant>,
    /// Location probes still outstanding after a missing-input report.
    pub(crate) pending_probes: usize,
    pub(crate) created_at: Instant,
}

impl Task {
    pub fn from_descriptor(desc: &TaskDescriptor, parent: Option<TaskId>, now: Instant) -> Self {
        let dependencies = desc
            .dependencies
            .iter()
            .map(|(name, r)| (name.clone(), r.id().clone()))
            .collect();

        Self {
            id: desc.task_id.clone(),
            handler: desc.handler.clone(),
            dependencies,
            expected_outputs: desc.expected_outputs.clone(),
            private: desc.task_private.clone(),
            scheduling_class: desc
                .scheduling_class
                .clone()
                .unwrap_or_else(|| DEFAULT_SCHEDULING_CLASS.to_string()),
            parent,
            children: Vec::new(),
            state: TaskState::Created,
            assigned_worker: None,
            retry_count: 0,
            history: vec![(now, TaskEvent::Created)],
            failure: None,
            inputs: BTreeMap::new(),
            unresolved: BTreeSet::new(),
            unfinished_streams: BTreeSet::new(),
            reduce_epoch: 0,
            assigned_at: None,
            pending_probes: 0,
            created_at: now,
        }
    }

    /// Rebuild a descriptor, with bound input values where known.
    pub fn descriptor(&self) -> TaskDescriptor {
        let dependencies = self
            .dependencies
            .iter()
            .map(|(name, id)| {
                let value = self
                    .inputs
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| Reference::Future { id: id.clone() });
                (name.clone(), value)
            })
            .collect();

        TaskDescriptor {
            task_id: self.id.clone(),
            handler: self.handler.clone(),
            dependencies,
            expected_outputs: self.expected_outputs.clone(),
            task_private: self.private.clone(),
            scheduling_class: Some(self.scheduling_class.clone()),
        }
    }

    pub fn record(&mut self, now: Instant, event: TaskEvent) {
        self.history.push((now, event));
    }

    pub fn transition(&mut self, state: TaskState, now: Instant, event: TaskEvent) {
        self.state = state;
        self.record(now, event);
    }

    /// Not active and not failed: may be (re-)activated by a reduction.
    pub fn is_dormant(&self) -> bool {
        matches!(self.state, TaskState::Created | TaskState::Committed)
    }

    pub fn is_queueable(&self) -> bool {
        matches!(self.state, TaskState::Queued | TaskState::QueuedStreaming)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            TaskState::Committed | TaskState::Failed | TaskState::Aborted
        )
    }

    /// Distinct reference ids this task depends on.
    pub fn dependency_ids(&self) -> BTreeSet<RefId> {
        self.dependencies.values().cloned().collect()
    }

    pub fn bound_inputs(&self) -> impl Iterator<Item = &Reference> {
        self.inputs.values()
    }

    /// Worker this task is pinned to by a `Fixed` input, if any.
    pub fn constrained_location(&self) -> Option<&WorkerId> {
        self.inputs.values().find_map(|r| match r {
            Reference::Fixed { location, .. } => Some(location),
            _ => None,
        })
    }

    /// Forget bound inputs so the next reduction binds fresh values.
    pub(crate) fn reset_bindings(&mut self) {
        self.inputs.clear();
        self.unresolved.clear();
        self.unfinished_streams.clear();
        self.assigned_worker = None;
        self.assigned_at = None;
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            id: self.id.clone(),
            handler: self.handler.clone(),
            state: self.state,
            scheduling_class: self.scheduling_class.clone(),
            assigned_worker: self.assigned_worker.clone(),
            retry_count: self.retry_count,
            parent: self.parent.clone(),
            children: self.children.clone(),
            expected_outputs: self.expected_outputs.clone(),
            failure: self
                .failure
                .as_ref()
                .map(|f| (f.reason.to_string(), f.detail.clone())),
            history: self
                .history
                .iter()
                .map(|(at, event)| HistoryEntry {
                    elapsed_ms: at.saturating_duration_since(self.created_at).as_millis() as u64,
                    event: event.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub event: TaskEvent,
}

/// Read-only snapshot of a task for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub handler: String,
    pub state: TaskState,
    pub scheduling_class: String,
    pub assigned_worker: Option<WorkerId>,
    pub retry_count: u32,
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub expected_outputs: Vec<RefId>,
    pub failure: Option<(String, Option<String>)>,
    pub history: Vec<HistoryEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> TaskDescriptor {
        TaskDescriptor {
            task_id: TaskId::new(id),
            handler: "noop".to_string(),
            dependencies: BTreeMap::new(),
            expected_outputs: vec![RefId::new(format!("{id}:out"))],
            task_private: None,
            scheduling_class: None,
        }
    }

    #[test]
    fn duplicate_outputs_are_rejected() {
        let mut d = descriptor("t");
        d.expected_outputs.push(RefId::new("t:out"));
        assert!(matches!(d.validate(), Err(TaskweaveError::InvalidTask(_))));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut d = descriptor("t");
        d.dependencies
            .insert("loop".to_string(), Reference::future("t:out"));
        let err = d.validate().unwrap_err();
        assert!(err.to_string().contains("own output"));
    }

    #[test]
    fn task_defaults_to_default_scheduling_class() {
        let t = Task::from_descriptor(&descriptor("t"), None, Instant::now());
        assert_eq!(t.scheduling_class, DEFAULT_SCHEDULING_CLASS);
        assert_eq!(t.state, TaskState::Created);
        assert_eq!(t.history.len(), 1);
    }

    #[test]
    fn descriptor_json_accepts_missing_optional_fields() {
        let d: TaskDescriptor =
            serde_json::from_str(r#"{"task_id":"root","handler":"const","expected_outputs":["r"]}"#)
                .unwrap();
        assert!(d.dependencies.is_empty());
        assert_eq!(d.expected_outputs, vec![RefId::new("r")]);
        d.validate().unwrap();
    }
}
