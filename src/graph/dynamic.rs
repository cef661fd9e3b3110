// src/graph/dynamic.rs

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::errors::{Result, TaskweaveError};
use crate::graph::ref_table::{RefEntry, Subscriber};
use crate::recovery::FailureReason;
use crate::reference::{RefId, Reference, WorkerId, combine};
use crate::task::{Task, TaskDescriptor, TaskEvent, TaskFailure, TaskId, TaskState};

/// What a graph operation changed that the layers above must act on.
#[derive(Debug, Default, Clone)]
pub struct GraphDelta {
    /// Tasks that became `RUNNABLE`, in activation order.
    pub runnable: Vec<TaskId>,
    /// Values delivered to external watchers.
    pub watched: Vec<Reference>,
    /// Tasks that failed permanently as a consequence of this operation.
    pub failed: Vec<TaskId>,
}

impl GraphDelta {
    pub fn merge(&mut self, other: GraphDelta) {
        self.runnable.extend(other.runnable);
        self.watched.extend(other.watched);
        self.failed.extend(other.failed);
    }

    pub fn is_empty(&self) -> bool {
        self.runnable.is_empty() && self.watched.is_empty() && self.failed.is_empty()
    }
}

/// Pending publication: a value and the task that produced it, if any.
type Publication = (Reference, Option<TaskId>);

/// Index of tasks and references for one job, plus the reduction algorithm.
///
/// The graph grows while the job runs: tasks are registered when first
/// submitted or spawned, and references when first named. Nothing is ever
/// removed; the whole graph is dropped with its job.
#[derive(Debug)]
pub struct TaskGraph {
    tasks: BTreeMap<TaskId, Task>,
    refs: HashMap<RefId, RefEntry>,
    /// Reduction pass counter; tasks remember the last pass that visited them.
    epoch: u64,
    clock: SharedClock,
}

impl TaskGraph {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            tasks: BTreeMap::new(),
            refs: HashMap::new(),
            epoch: 0,
            clock,
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub(crate) fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Current observed value of a reference.
    pub fn reference(&self, id: &RefId) -> Option<&Reference> {
        self.refs.get(id).map(|e| &e.current)
    }

    pub fn producer_of(&self, id: &RefId) -> Option<&TaskId> {
        self.refs.get(id).and_then(|e| e.producer.as_ref())
    }

    /// Number of tasks per state.
    pub fn state_counts(&self) -> BTreeMap<TaskState, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.state).or_insert(0) += 1;
        }
        counts
    }

    /// Register a task if it is unseen and make it the producer of its
    /// expected outputs.
    ///
    /// If one of those outputs already has subscribers, somebody is waiting
    /// for this task and it is reduced immediately.
    pub fn spawn(&mut self, desc: &TaskDescriptor, parent: Option<&TaskId>) -> Result<GraphDelta> {
        let mut delta = GraphDelta::default();
        if let Some(id) = self.register(desc, parent, &mut delta)? {
            self.reduce_into(std::slice::from_ref(&id), &mut delta)?;
        }
        Ok(delta)
    }

    /// Register a task read back from a journal.
    ///
    /// Unlike [`Self::spawn`] this never reduces: replay only rebuilds the
    /// graph, and the caller reduces for the job's result once every record
    /// is in.
    pub fn restore(&mut self, desc: &TaskDescriptor) -> Result<GraphDelta> {
        let mut delta = GraphDelta::default();
        self.register(desc, None, &mut delta)?;
        Ok(delta)
    }

    /// Insert the task, fold in the values its descriptor carries and claim
    /// its outputs. Returns the task id if somebody already wants it.
    fn register(
        &mut self,
        desc: &TaskDescriptor,
        parent: Option<&TaskId>,
        delta: &mut GraphDelta,
    ) -> Result<Option<TaskId>> {
        desc.validate()?;

        if self.tasks.contains_key(&desc.task_id) {
            debug!(task = %desc.task_id, "spawn of known task; ignoring");
            return Ok(None);
        }

        let now = self.clock.now();
        let task = Task::from_descriptor(desc, parent.cloned(), now);
        let id = task.id.clone();
        self.tasks.insert(id.clone(), task);

        if let Some(parent) = parent {
            if let Some(p) = self.tasks.get_mut(parent) {
                p.children.push(id.clone());
            }
        }

        // Values passed by the spawner are facts about those references.
        let carried: VecDeque<Publication> = desc
            .dependencies
            .values()
            .filter(|r| !r.is_future())
            .map(|r| (r.clone(), None))
            .collect();
        for dep in desc.dependencies.values().filter(|r| r.is_future()) {
            self.refs
                .entry(dep.id().clone())
                .or_insert_with(|| RefEntry::new(dep.id().clone()));
        }
        self.run_publications(carried, delta);

        let mut wanted = false;
        for out in &desc.expected_outputs {
            let entry = self
                .refs
                .entry(out.clone())
                .or_insert_with(|| RefEntry::new(out.clone()));
            entry.producer = Some(id.clone());
            if entry.has_subscribers() && !entry.current.is_terminal() {
                wanted = true;
            }
        }

        debug!(
            task = %id,
            parent = ?parent,
            outputs = desc.expected_outputs.len(),
            wanted,
            "spawned task"
        );

        Ok(wanted.then_some(id))
    }

    /// Fold an observation into the reference table and notify subscribers
    /// when the result is consumable (or an error).
    pub fn publish(&mut self, reference: &Reference, producer: Option<&TaskId>) -> GraphDelta {
        let mut delta = GraphDelta::default();
        let work = VecDeque::from([(reference.clone(), producer.cloned())]);
        self.run_publications(work, &mut delta);
        delta
    }

    /// Register interest in a reference. Fires immediately if the value is
    /// already consumable.
    pub fn subscribe(&mut self, id: &RefId, subscriber: Subscriber) -> GraphDelta {
        let mut delta = GraphDelta::default();
        let entry = self
            .refs
            .entry(id.clone())
            .or_insert_with(|| RefEntry::new(id.clone()));
        let current = entry.current.clone();

        if !(current.is_consumable() || current.is_error()) {
            entry.add_subscriber(subscriber);
            return delta;
        }

        if current.is_streaming() {
            entry.add_subscriber(subscriber.clone());
        }

        let mut work = VecDeque::new();
        match subscriber {
            Subscriber::External => delta.watched.push(current),
            Subscriber::Task(tid) => self.notify_task(&tid, &current, &mut work, &mut delta),
        }
        self.run_publications(work, &mut delta);
        delta
    }

    /// Reduce from explicit task roots.
    pub fn reduce(&mut self, roots: &[TaskId]) -> Result<GraphDelta> {
        let mut delta = GraphDelta::default();
        self.reduce_into(roots, &mut delta)?;
        Ok(delta)
    }

    /// Reduce from the producers of the given output ids.
    ///
    /// Outputs that are already consumable (or failed) need no work. An
    /// output with no known producer is a consistency error.
    pub fn reduce_for_outputs(&mut self, outputs: &[RefId]) -> Result<GraphDelta> {
        let mut roots = Vec::new();
        for id in outputs {
            let entry = self
                .refs
                .get(id)
                .ok_or_else(|| TaskweaveError::UnknownReference(id.clone()))?;
            if entry.current.is_consumable() || entry.current.is_error() {
                continue;
            }
            let producer = entry
                .producer
                .clone()
                .ok_or_else(|| TaskweaveError::UnknownReference(id.clone()))?;
            roots.push(producer);
        }
        self.reduce(&roots)
    }

    /// Breadth-first backward walk from `roots` over dormant producers.
    ///
    /// Every task is visited at most once per pass: the pass number is
    /// stamped on a task when it is enqueued, and only dormant tasks
    /// (`CREATED` or `COMMITTED`) are enqueued.
    fn reduce_into(&mut self, roots: &[TaskId], delta: &mut GraphDelta) -> Result<()> {
        if let Some(missing) = roots.iter().find(|r| !self.tasks.contains_key(*r)) {
            return Err(TaskweaveError::UnknownTask(missing.clone()));
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let now = self.clock.now();

        let mut queue: VecDeque<TaskId> = VecDeque::new();
        for root in roots {
            if let Some(task) = self.tasks.get_mut(root) {
                if task.reduce_epoch != epoch && task.is_dormant() {
                    task.reduce_epoch = epoch;
                    queue.push_back(root.clone());
                }
            }
        }

        let mut work: VecDeque<Publication> = VecDeque::new();

        while let Some(tid) = queue.pop_front() {
            let deps = match self.tasks.get(&tid) {
                Some(task) => task.dependency_ids(),
                None => continue,
            };

            let mut bound = Vec::new();
            let mut waiting = Vec::new();
            let mut failed_input = None;

            for ref_id in deps {
                let entry = self
                    .refs
                    .entry(ref_id.clone())
                    .or_insert_with(|| RefEntry::new(ref_id.clone()));
                let current = entry.current.clone();

                if current.is_error() {
                    failed_input = Some(current);
                    break;
                }

                if current.is_consumable() {
                    if current.is_streaming() {
                        entry.add_subscriber(Subscriber::Task(tid.clone()));
                    }
                    bound.push(current);
                    continue;
                }

                entry.add_subscriber(Subscriber::Task(tid.clone()));
                waiting.push(ref_id.clone());

                let Some(producer) = entry.producer.clone() else {
                    continue;
                };
                if let Some(p) = self.tasks.get_mut(&producer) {
                    if p.reduce_epoch != epoch && p.is_dormant() {
                        p.reduce_epoch = epoch;
                        p.state = TaskState::Blocking;
                        queue.push_back(producer);
                    }
                }
            }

            if let Some(err) = failed_input {
                self.fail_on_input(&tid, &err, &mut work, delta);
                continue;
            }

            let Some(task) = self.tasks.get_mut(&tid) else {
                continue;
            };
            task.reset_bindings();
            for value in bound {
                bind_input(task, value);
            }
            task.unresolved.extend(waiting);

            if task.unresolved.is_empty() {
                task.transition(TaskState::Runnable, now, TaskEvent::Runnable);
                delta.runnable.push(tid.clone());
            } else {
                let waiting_on = task.unresolved.len();
                task.transition(TaskState::Blocking, now, TaskEvent::Blocked { waiting_on });
            }
        }

        self.run_publications(work, delta);
        Ok(())
    }

    /// Drain publications: fold each into the table and notify subscribers.
    /// Failures cascading to downstream outputs are appended to the same
    /// worklist.
    fn run_publications(&mut self, mut work: VecDeque<Publication>, delta: &mut GraphDelta) {
        while let Some((reference, producer)) = work.pop_front() {
            let id = reference.id().clone();
            let entry = self
                .refs
                .entry(id.clone())
                .or_insert_with(|| RefEntry::new(id.clone()));

            let merged = combine(&entry.current, &reference);
            if let Some(p) = producer {
                entry.producer = Some(p);
            }
            if merged == entry.current {
                continue;
            }
            debug!(
                reference = %id,
                from = entry.current.kind(),
                to = merged.kind(),
                "reference updated"
            );
            entry.current = merged.clone();

            if !(merged.is_consumable() || merged.is_error()) {
                continue;
            }

            // Stream subscriptions persist until the stream resolves.
            let subscribers = if merged.is_streaming() {
                entry.subscribers.clone()
            } else {
                std::mem::take(&mut entry.subscribers)
            };

            for subscriber in subscribers {
                match subscriber {
                    Subscriber::External => delta.watched.push(merged.clone()),
                    Subscriber::Task(tid) => self.notify_task(&tid, &merged, &mut work, delta),
                }
            }
        }
    }

    /// Deliver a consumable (or error) value to a subscribed task.
    fn notify_task(
        &mut self,
        tid: &TaskId,
        value: &Reference,
        work: &mut VecDeque<Publication>,
        delta: &mut GraphDelta,
    ) {
        if value.is_error() {
            self.fail_on_input(tid, value, work, delta);
            return;
        }

        let now = self.clock.now();
        let Some(task) = self.tasks.get_mut(tid) else {
            warn!(task = %tid, "subscription for unknown task");
            return;
        };

        match task.state {
            TaskState::Blocking => {
                bind_input(task, value.clone());
                if task.unresolved.is_empty() {
                    task.transition(TaskState::Runnable, now, TaskEvent::Runnable);
                    delta.runnable.push(tid.clone());
                }
            }
            TaskState::Runnable
            | TaskState::Queued
            | TaskState::QueuedStreaming
            | TaskState::Assigned => {
                bind_input(task, value.clone());
                if task.state == TaskState::QueuedStreaming && task.unfinished_streams.is_empty() {
                    task.state = TaskState::Queued;
                    debug!(task = %tid, "all streaming inputs resolved");
                }
            }
            _ => {}
        }
    }

    /// Fail `tid` because one of its inputs resolved to an error, passing the
    /// original reason on to its outputs.
    fn fail_on_input(
        &mut self,
        tid: &TaskId,
        error: &Reference,
        work: &mut VecDeque<Publication>,
        delta: &mut GraphDelta,
    ) {
        let now = self.clock.now();
        let Some(task) = self.tasks.get_mut(tid) else {
            return;
        };
        if task.is_terminal() {
            return;
        }

        let (reason, detail) = match error {
            Reference::Error { reason, detail, .. } => (reason.clone(), detail.clone()),
            other => (FailureReason::DependencyFailed.to_string(), Some(other.to_string())),
        };

        warn!(task = %tid, input = %error.id(), %reason, "input failed; failing task");

        task.failure = Some(TaskFailure {
            reason: FailureReason::DependencyFailed,
            detail: Some(format!("input {} failed: {}", error.id(), reason)),
        });
        task.transition(
            TaskState::Failed,
            now,
            TaskEvent::Failed {
                reason: FailureReason::DependencyFailed.to_string(),
            },
        );
        delta.failed.push(tid.clone());

        for out in &task.expected_outputs {
            work.push_back((
                Reference::error(out.clone(), reason.clone(), detail.clone()),
                Some(tid.clone()),
            ));
        }
    }

    /// Apply a successful completion batch: spawn children, publish
    /// references, then mark the task committed.
    ///
    /// The batch is rejected as a whole if any spawned descriptor is invalid.
    pub fn commit_task(
        &mut self,
        tid: &TaskId,
        spawned: &[TaskDescriptor],
        published: &[Reference],
    ) -> Result<GraphDelta> {
        if !self.tasks.contains_key(tid) {
            return Err(TaskweaveError::UnknownTask(tid.clone()));
        }
        for child in spawned {
            child.validate()?;
        }

        let mut delta = GraphDelta::default();
        for child in spawned {
            delta.merge(self.spawn(child, Some(tid))?);
        }

        let outputs = self
            .tasks
            .get(tid)
            .map(|t| t.expected_outputs.clone())
            .unwrap_or_default();

        for reference in published {
            let producer = outputs.contains(reference.id()).then_some(tid);
            delta.merge(self.publish(reference, producer));
        }

        let now = self.clock.now();
        if let Some(task) = self.tasks.get_mut(tid) {
            task.assigned_worker = None;
            task.transition(TaskState::Committed, now, TaskEvent::Committed);
        }
        Ok(delta)
    }

    /// Fail a task permanently, publishing an error on each expected output.
    pub fn fail_task(
        &mut self,
        tid: &TaskId,
        reason: FailureReason,
        detail: Option<String>,
    ) -> Result<GraphDelta> {
        let now = self.clock.now();
        let task = self
            .tasks
            .get_mut(tid)
            .ok_or_else(|| TaskweaveError::UnknownTask(tid.clone()))?;

        let mut delta = GraphDelta::default();
        if task.is_terminal() && task.state != TaskState::Committed {
            return Ok(delta);
        }

        task.failure = Some(TaskFailure {
            reason: reason.clone(),
            detail: detail.clone(),
        });
        task.assigned_worker = None;
        task.transition(
            TaskState::Failed,
            now,
            TaskEvent::Failed {
                reason: reason.to_string(),
            },
        );
        delta.failed.push(tid.clone());

        let work: VecDeque<Publication> = task
            .expected_outputs
            .iter()
            .map(|out| {
                (
                    Reference::error(out.clone(), reason.to_string(), detail.clone()),
                    Some(tid.clone()),
                )
            })
            .collect();
        self.run_publications(work, &mut delta);
        Ok(delta)
    }

    /// Return a failed or interrupted task to `CREATED` and reduce it again.
    pub fn restart_task(&mut self, tid: &TaskId, event: TaskEvent) -> Result<GraphDelta> {
        let now = self.clock.now();
        let task = self
            .tasks
            .get_mut(tid)
            .ok_or_else(|| TaskweaveError::UnknownTask(tid.clone()))?;
        task.reset_bindings();
        task.failure = None;
        task.pending_probes = 0;
        task.transition(TaskState::Created, now, event);
        self.reduce(std::slice::from_ref(tid))
    }

    /// Cancel a task. Returns the worker it was assigned to, if any.
    ///
    /// Outputs of an aborted task resolve to `Error(ABORTED)` so that no
    /// consumer waits forever.
    pub fn abort_task(&mut self, tid: &TaskId) -> Result<(Option<WorkerId>, GraphDelta)> {
        let now = self.clock.now();
        let task = self
            .tasks
            .get_mut(tid)
            .ok_or_else(|| TaskweaveError::UnknownTask(tid.clone()))?;

        let mut delta = GraphDelta::default();
        if task.is_terminal() && task.pending_probes == 0 {
            return Ok((None, delta));
        }

        let worker = task.assigned_worker.take();
        task.pending_probes = 0;
        task.failure = Some(TaskFailure {
            reason: FailureReason::Aborted,
            detail: None,
        });
        task.transition(TaskState::Aborted, now, TaskEvent::Aborted);

        let work: VecDeque<Publication> = task
            .expected_outputs
            .iter()
            .map(|out| {
                (
                    Reference::error(out.clone(), FailureReason::Aborted.to_string(), None),
                    Some(tid.clone()),
                )
            })
            .collect();
        self.run_publications(work, &mut delta);
        Ok((worker, delta))
    }

    /// `RUNNABLE -> QUEUED` (or `QUEUED_STREAMING` while a streaming input
    /// is still growing).
    pub(crate) fn mark_queued(&mut self, tid: &TaskId, candidates: usize) {
        let now = self.clock.now();
        if let Some(task) = self.tasks.get_mut(tid) {
            let state = if task.unfinished_streams.is_empty() {
                TaskState::Queued
            } else {
                TaskState::QueuedStreaming
            };
            task.transition(state, now, TaskEvent::Queued { candidates });
        }
    }

    pub(crate) fn mark_assigned(&mut self, tid: &TaskId, worker: &WorkerId) {
        let now = self.clock.now();
        if let Some(task) = self.tasks.get_mut(tid) {
            task.assigned_worker = Some(worker.clone());
            task.assigned_at = Some(now);
            task.transition(
                TaskState::Assigned,
                now,
                TaskEvent::Assigned {
                    worker: worker.clone(),
                },
            );
        }
    }
}

fn bind_input(task: &mut Task, value: Reference) {
    let id = value.id().clone();
    task.unresolved.remove(&id);
    if value.is_streaming() {
        task.unfinished_streams.insert(id.clone());
    } else {
        task.unfinished_streams.remove(&id);
    }
    task.inputs.insert(id, value);
}
