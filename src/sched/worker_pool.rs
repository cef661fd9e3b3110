// src/sched/worker_pool.rs

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::reference::WorkerId;
use crate::task::{JobId, TaskId};
use crate::types::DEFAULT_SCHEDULING_CLASS;

/// What a worker announces when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: WorkerId,
    /// Network address the worker serves on.
    pub location: String,
    /// Handlers this worker can execute. Empty means any handler.
    #[serde(default)]
    pub handlers: BTreeSet<String>,
    /// Scheduling class -> concurrent task capacity.
    #[serde(default = "default_capacity")]
    pub capacity: BTreeMap<String, usize>,
}

fn default_capacity() -> BTreeMap<String, usize> {
    BTreeMap::from([(DEFAULT_SCHEDULING_CLASS.to_string(), 1)])
}

impl WorkerSpec {
    pub fn new(id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: WorkerId::new(id),
            location: location.into(),
            handlers: BTreeSet::new(),
            capacity: default_capacity(),
        }
    }

    pub fn with_handlers<I, S>(mut self, handlers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handlers = handlers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capacity(mut self, class: impl Into<String>, slots: usize) -> Self {
        self.capacity.insert(class.into(), slots);
        self
    }
}

/// A registered worker and its current load.
#[derive(Debug, Clone)]
pub struct Worker {
    pub spec: WorkerSpec,
    pub last_heartbeat: Instant,
    /// Tasks currently assigned, per scheduling class.
    assigned: BTreeMap<String, BTreeSet<(JobId, TaskId)>>,
}

impl Worker {
    pub fn id(&self) -> &WorkerId {
        &self.spec.id
    }

    pub fn supports_handler(&self, handler: &str) -> bool {
        self.spec.handlers.is_empty() || self.spec.handlers.contains(handler)
    }

    pub fn capacity(&self, class: &str) -> usize {
        self.spec.capacity.get(class).copied().unwrap_or(0)
    }

    /// Eligible to run `handler` in `class` at all, ignoring current load.
    pub fn accepts(&self, handler: &str, class: &str) -> bool {
        self.capacity(class) > 0 && self.supports_handler(handler)
    }

    pub fn assigned_count(&self, class: &str) -> usize {
        self.assigned.get(class).map_or(0, BTreeSet::len)
    }

    pub fn free_slots(&self, class: &str) -> usize {
        self.capacity(class).saturating_sub(self.assigned_count(class))
    }

    /// Fraction of the class capacity in use; 1.0 for a class without slots.
    pub fn load(&self, class: &str) -> f64 {
        match self.capacity(class) {
            0 => 1.0,
            cap => self.assigned_count(class) as f64 / cap as f64,
        }
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.spec.capacity.keys().map(String::as_str)
    }

    /// Every `(job, task)` assigned here, across classes.
    pub fn assignments(&self) -> impl Iterator<Item = &(JobId, TaskId)> {
        self.assigned.values().flatten()
    }
}

/// Registry of live workers.
#[derive(Debug)]
pub struct WorkerPool {
    workers: BTreeMap<WorkerId, Worker>,
    clock: SharedClock,
}

impl WorkerPool {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            workers: BTreeMap::new(),
            clock,
        }
    }

    /// Add a worker, or refresh the spec of a known one (keeping its
    /// assignments). Returns `true` for a new worker.
    pub fn register(&mut self, spec: WorkerSpec) -> bool {
        let now = self.clock.now();
        match self.workers.get_mut(&spec.id) {
            Some(existing) => {
                info!(worker = %spec.id, "worker re-registered");
                existing.spec = spec;
                existing.last_heartbeat = now;
                false
            }
            None => {
                info!(
                    worker = %spec.id,
                    location = %spec.location,
                    classes = ?spec.capacity,
                    "worker registered"
                );
                self.workers.insert(
                    spec.id.clone(),
                    Worker {
                        spec,
                        last_heartbeat: now,
                        assigned: BTreeMap::new(),
                    },
                );
                true
            }
        }
    }

    /// Record a heartbeat. Returns `false` for an unknown worker.
    pub fn heartbeat(&mut self, id: &WorkerId) -> bool {
        let now = self.clock.now();
        match self.workers.get_mut(id) {
            Some(w) => {
                w.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// Workers silent for longer than `timeout`.
    pub fn expired(&self, timeout: Duration) -> Vec<WorkerId> {
        let now = self.clock.now();
        self.workers
            .values()
            .filter(|w| now.saturating_duration_since(w.last_heartbeat) > timeout)
            .map(|w| w.id().clone())
            .collect()
    }

    pub fn deregister(&mut self, id: &WorkerId) -> Option<Worker> {
        let removed = self.workers.remove(id);
        if let Some(w) = &removed {
            warn!(
                worker = %id,
                in_flight = w.assignments().count(),
                "worker deregistered"
            );
        }
        removed
    }

    pub fn get(&self, id: &WorkerId) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.keys().cloned().collect()
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    /// Workers that can run `handler` in `class`, in id order.
    pub fn eligible(&self, handler: &str, class: &str) -> Vec<&Worker> {
        self.workers
            .values()
            .filter(|w| w.accepts(handler, class))
            .collect()
    }

    pub(crate) fn assign(&mut self, id: &WorkerId, class: &str, job: &JobId, task: &TaskId) {
        if let Some(w) = self.workers.get_mut(id) {
            w.assigned
                .entry(class.to_string())
                .or_default()
                .insert((job.clone(), task.clone()));
        }
    }

    /// Free the slot held by `task`. Unknown workers and tasks are ignored.
    pub(crate) fn release(&mut self, id: &WorkerId, class: &str, job: &JobId, task: &TaskId) {
        if let Some(set) = self
            .workers
            .get_mut(id)
            .and_then(|w| w.assigned.get_mut(class))
        {
            set.remove(&(job.clone(), task.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::{ManualClock, SharedClock};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn capacity_and_load_are_per_class() {
        let clock: SharedClock = Arc::new(ManualClock::new());
        let mut pool = WorkerPool::new(clock);
        pool.register(WorkerSpec::new("w1", "local").with_capacity("default", 2));

        let w = WorkerId::new("w1");
        pool.assign(&w, "default", &JobId::new("j"), &TaskId::new("t1"));

        let worker = pool.get(&w).unwrap();
        assert_eq!(worker.free_slots("default"), 1);
        assert_eq!(worker.load("default"), 0.5);
        assert_eq!(worker.free_slots("disk"), 0);
        assert!(!worker.accepts("any", "disk"));

        pool.release(&w, "default", &JobId::new("j"), &TaskId::new("t1"));
        assert_eq!(pool.get(&w).unwrap().free_slots("default"), 2);
    }

    #[test]
    fn silent_workers_expire() {
        let clock = Arc::new(ManualClock::new());
        let mut pool = WorkerPool::new(clock.clone());
        pool.register(WorkerSpec::new("w1", "a"));
        pool.register(WorkerSpec::new("w2", "b"));

        clock.advance(Duration::from_secs(20));
        assert!(pool.heartbeat(&WorkerId::new("w2")));
        clock.advance(Duration::from_secs(15));

        assert_eq!(pool.expired(Duration::from_secs(30)), vec![WorkerId::new("w1")]);
        assert!(!pool.heartbeat(&WorkerId::new("nope")));
    }

    #[test]
    fn handler_filter_applies_only_when_listed() {
        let clock: SharedClock = Arc::new(ManualClock::new());
        let mut pool = WorkerPool::new(clock);
        pool.register(WorkerSpec::new("any", "a"));
        pool.register(WorkerSpec::new("py", "b").with_handlers(["python"]));

        let ids: Vec<_> = pool
            .eligible("java", "default")
            .iter()
            .map(|w| w.id().as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["any"]);
        assert_eq!(pool.eligible("python", "default").len(), 2);
    }
}
