// src/sched/queues.rs

use std::collections::{BTreeMap, VecDeque};

use crate::reference::WorkerId;
use crate::task::TaskId;

/// Per-job placement queues.
///
/// A task may sit in several worker queues and in the class backlog at the
/// same time. Entries are never removed eagerly when the task is assigned
/// elsewhere; consumers skip entries whose task is no longer queueable.
#[derive(Debug, Default)]
pub struct JobQueues {
    per_worker: BTreeMap<(WorkerId, String), VecDeque<TaskId>>,
    backlog: BTreeMap<String, VecDeque<TaskId>>,
}

impl JobQueues {
    pub fn push_worker(&mut self, worker: &WorkerId, class: &str, task: TaskId) {
        self.per_worker
            .entry((worker.clone(), class.to_string()))
            .or_default()
            .push_back(task);
    }

    pub fn push_backlog(&mut self, class: &str, task: TaskId) {
        self.backlog
            .entry(class.to_string())
            .or_default()
            .push_back(task);
    }

    /// Drop stale entries from the head of a worker queue and return the
    /// first live one without removing it.
    ///
    /// `live` must only reject tasks that can no longer be queued anywhere:
    /// a pinned task has no other queue to fall back on.
    pub fn peek_worker(
        &mut self,
        worker: &WorkerId,
        class: &str,
        mut live: impl FnMut(&TaskId) -> bool,
    ) -> Option<&TaskId> {
        let queue = self.per_worker.get_mut(&(worker.clone(), class.to_string()))?;
        while let Some(head) = queue.front() {
            if live(head) {
                break;
            }
            queue.pop_front();
        }
        queue.front()
    }

    pub fn pop_worker(&mut self, worker: &WorkerId, class: &str) -> Option<TaskId> {
        self.per_worker
            .get_mut(&(worker.clone(), class.to_string()))?
            .pop_front()
    }

    /// Position of the first backlog entry that is live and `acceptable`.
    ///
    /// Stale entries met on the way are discarded; live entries the caller
    /// cannot accept stay for other workers.
    pub fn find_backlog(
        &mut self,
        class: &str,
        mut live: impl FnMut(&TaskId) -> bool,
        mut acceptable: impl FnMut(&TaskId) -> bool,
    ) -> Option<usize> {
        let queue = self.backlog.get_mut(class)?;
        queue.retain(|t| live(t));
        queue.iter().position(|t| acceptable(t))
    }

    pub fn take_backlog(&mut self, class: &str, index: usize) -> Option<TaskId> {
        self.backlog.get_mut(class)?.remove(index)
    }

    /// Remove every queue belonging to `worker`, returning `(class, task)`
    /// entries in queue order.
    pub fn remove_worker(&mut self, worker: &WorkerId) -> Vec<(String, TaskId)> {
        let keys: Vec<_> = self
            .per_worker
            .keys()
            .filter(|(w, _)| w == worker)
            .cloned()
            .collect();

        let mut drained = Vec::new();
        for key in keys {
            if let Some(queue) = self.per_worker.remove(&key) {
                drained.extend(queue.into_iter().map(|t| (key.1.clone(), t)));
            }
        }
        drained
    }

    pub fn is_empty(&self) -> bool {
        self.per_worker.values().all(VecDeque::is_empty)
            && self.backlog.values().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_heads_are_skipped() {
        let mut q = JobQueues::default();
        let w = WorkerId::new("w1");
        q.push_worker(&w, "default", TaskId::new("done"));
        q.push_worker(&w, "default", TaskId::new("live"));

        let head = q.peek_worker(&w, "default", |t| t.as_str() == "live").cloned();
        assert_eq!(head, Some(TaskId::new("live")));
        assert_eq!(q.pop_worker(&w, "default"), Some(TaskId::new("live")));
        assert!(q.is_empty());
    }

    #[test]
    fn backlog_keeps_entries_the_worker_cannot_run() {
        let mut q = JobQueues::default();
        q.push_backlog("default", TaskId::new("java"));
        q.push_backlog("default", TaskId::new("py"));

        let idx = q
            .find_backlog("default", |_| true, |t| t.as_str() == "py")
            .unwrap();
        assert_eq!(q.take_backlog("default", idx), Some(TaskId::new("py")));
        assert!(!q.is_empty());
    }

    #[test]
    fn removed_worker_returns_its_entries() {
        let mut q = JobQueues::default();
        let w1 = WorkerId::new("w1");
        q.push_worker(&w1, "default", TaskId::new("a"));
        q.push_worker(&w1, "disk", TaskId::new("b"));
        q.push_worker(&WorkerId::new("w2"), "default", TaskId::new("c"));

        let drained = q.remove_worker(&w1);
        assert_eq!(drained.len(), 2);
        assert!(drained.contains(&("disk".to_string(), TaskId::new("b"))));
    }
}
