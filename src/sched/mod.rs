// src/sched/mod.rs

//! Turning runnable tasks into worker assignments.
//!
//! - [`worker_pool`]: registered workers, capacities, heartbeats.
//! - [`policy`]: placement policies proposing candidate workers.
//! - [`queues`]: per-job, per-worker queues plus a per-class backlog.
//! - [`lottery`]: ticket-based sharing of free slots between jobs.
//! - [`scheduler`]: enqueueing and the assignment loop.

pub mod lottery;
pub mod policy;
pub mod queues;
pub mod scheduler;
pub mod worker_pool;

pub use lottery::LotterySettings;
pub use policy::{LocalitySettings, PlacementPolicy, policy_for};
pub use scheduler::{Assignment, EnqueueOutcome, Scheduler};
pub use worker_pool::{Worker, WorkerPool, WorkerSpec};
