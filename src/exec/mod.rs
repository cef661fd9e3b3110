// src/exec/mod.rs

//! Execution layer: how assignments leave the master.
//!
//! - [`backend`] provides the `DispatchBackend` trait the runtime talks to,
//!   and a `ChannelBackend` that forwards requests to a transport task.
//! - [`local`] runs assignments in-process with a registry of async
//!   handlers and an in-memory block store per worker.

pub mod backend;
pub mod local;

pub use backend::{BackendRequest, ChannelBackend, DispatchBackend, ProbeFuture};
pub use local::{
    BlockStore, HandlerOutput, HandlerRegistry, LocalBackend, TaskContext, spawn_heartbeats,
};
