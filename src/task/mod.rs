// src/task/mod.rs

//! Task and job records.
//!
//! - [`task_info`] holds the submitted [`TaskDescriptor`], the live [`Task`]
//!   and its state machine.
//! - [`job`] groups a root task with the graph it unfolds into.

pub mod job;
pub mod task_info;

pub use job::{Job, JobId, JobState, JobStatus};
pub use task_info::{
    HistoryEntry, Task, TaskDescriptor, TaskEvent, TaskFailure, TaskId, TaskState, TaskStatus,
};
