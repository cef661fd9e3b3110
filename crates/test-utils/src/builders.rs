#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use taskweave::engine::{CompletionReport, TaskOutcome};
use taskweave::recovery::{FailedBinding, FailureReason};
use taskweave::reference::{RefId, Reference, WorkerId};
use taskweave::sched::WorkerSpec;
use taskweave::task::{JobId, TaskDescriptor, TaskId};

/// Builder for `TaskDescriptor` to simplify test setup.
pub struct TaskBuilder {
    desc: TaskDescriptor,
}

impl TaskBuilder {
    pub fn new(id: &str, handler: &str) -> Self {
        Self {
            desc: TaskDescriptor {
                task_id: TaskId::new(id),
                handler: handler.to_string(),
                dependencies: BTreeMap::new(),
                expected_outputs: Vec::new(),
                task_private: None,
                scheduling_class: None,
            },
        }
    }

    /// Depend on `reference` under the local name `name`.
    pub fn dep(mut self, name: &str, reference: Reference) -> Self {
        self.desc.dependencies.insert(name.to_string(), reference);
        self
    }

    /// Depend on a future with the same local name as its id.
    pub fn after(self, id: &str) -> Self {
        self.dep(id, Reference::future(id))
    }

    pub fn output(mut self, id: &str) -> Self {
        self.desc.expected_outputs.push(RefId::new(id));
        self
    }

    pub fn private(mut self, bytes: &[u8]) -> Self {
        self.desc.task_private = Some(value(&format!("{}:private", self.desc.task_id), bytes));
        self
    }

    pub fn class(mut self, class: &str) -> Self {
        self.desc.scheduling_class = Some(class.to_string());
        self
    }

    pub fn build(self) -> TaskDescriptor {
        self.desc
    }
}

/// `TaskBuilder` with the `noop` handler.
pub fn task(id: &str) -> TaskBuilder {
    TaskBuilder::new(id, "noop")
}

pub fn value(id: &str, bytes: &[u8]) -> Reference {
    Reference::DataValue {
        id: RefId::new(id),
        value: bytes.to_vec(),
    }
}

pub fn fixed(id: &str, worker: &str) -> Reference {
    Reference::Fixed {
        id: RefId::new(id),
        location: WorkerId::new(worker),
    }
}

pub fn sweetheart(id: &str, preferred: &str, size: u64) -> Reference {
    Reference::Sweetheart {
        id: RefId::new(id),
        preferred: WorkerId::new(preferred),
        size_hint: Some(size),
        hints: BTreeSet::new(),
    }
}

/// Worker with one slot in the default class, accepting any handler.
pub fn worker(id: &str) -> WorkerSpec {
    WorkerSpec::new(id, format!("{id}.local:9000"))
}

/// Worker with `slots` slots in the default class.
pub fn worker_with_slots(id: &str, slots: usize) -> WorkerSpec {
    worker(id).with_capacity("default", slots)
}

pub fn committed(job: &JobId, task: &str, worker: &str, published: Vec<Reference>) -> CompletionReport {
    spawned_and_committed(job, task, worker, Vec::new(), published)
}

pub fn spawned_and_committed(
    job: &JobId,
    task: &str,
    worker: &str,
    spawned: Vec<TaskDescriptor>,
    published: Vec<Reference>,
) -> CompletionReport {
    CompletionReport {
        job: job.clone(),
        task: TaskId::new(task),
        worker: WorkerId::new(worker),
        outcome: TaskOutcome::Committed { spawned, published },
    }
}

pub fn failed(job: &JobId, task: &str, worker: &str, reason: FailureReason) -> CompletionReport {
    CompletionReport {
        job: job.clone(),
        task: TaskId::new(task),
        worker: WorkerId::new(worker),
        outcome: TaskOutcome::Failed {
            reason,
            detail: None,
            failed_bindings: Vec::new(),
        },
    }
}

/// `MISSING_INPUT` for one reference last seen at `locations`.
pub fn missing_input(
    job: &JobId,
    task: &str,
    worker: &str,
    reference: &str,
    locations: &[&str],
) -> CompletionReport {
    CompletionReport {
        job: job.clone(),
        task: TaskId::new(task),
        worker: WorkerId::new(worker),
        outcome: TaskOutcome::Failed {
            reason: FailureReason::MissingInput,
            detail: None,
            failed_bindings: vec![FailedBinding {
                reference: RefId::new(reference),
                locations: locations.iter().map(|w| WorkerId::new(*w)).collect(),
            }],
        },
    }
}
