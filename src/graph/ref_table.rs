// src/graph/ref_table.rs

use crate::reference::{RefId, Reference};
use crate::task::TaskId;

/// Who wants to hear about a reference's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscriber {
    /// A task that depends on the reference.
    Task(TaskId),
    /// An external watcher, such as the job waiting for its result.
    External,
}

/// One row of the reference table.
#[derive(Debug, Clone)]
pub struct RefEntry {
    pub current: Reference,
    pub producer: Option<TaskId>,
    pub(crate) subscribers: Vec<Subscriber>,
}

impl RefEntry {
    pub fn new(id: RefId) -> Self {
        Self {
            current: Reference::Future { id },
            producer: None,
            subscribers: Vec::new(),
        }
    }

    pub(crate) fn add_subscriber(&mut self, subscriber: Subscriber) {
        if !self.subscribers.contains(&subscriber) {
            self.subscribers.push(subscriber);
        }
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }
}
