// src/exec/backend.rs

//! Pluggable dispatch backend abstraction.
//!
//! The runtime talks to a `DispatchBackend` instead of a concrete transport.
//! This makes it easy to swap in a fake backend in tests while keeping the
//! in-process executor in [`super::local`].
//!
//! - [`ChannelBackend`] forwards every request over an mpsc channel to
//!   whatever owns the receiving end (a transport task, or a test).
//! - [`super::local::LocalBackend`] runs assignments on tokio tasks.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::errors::{Error, Result};
use crate::reference::{RefId, WorkerId};
use crate::sched::Assignment;
use crate::task::{JobId, TaskId};

/// Future returned by a location probe: `true` if the worker answered and
/// still holds the data.
pub type ProbeFuture = Pin<Box<dyn Future<Output = bool> + Send + 'static>>;

/// How the master reaches its workers.
pub trait DispatchBackend: Send {
    /// Start executing the given assignments.
    ///
    /// Completion is reported back to the master asynchronously, through a
    /// `MasterHandle`; this only hands the work over.
    fn dispatch(
        &mut self,
        assignments: Vec<Assignment>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Ask a worker to stop running a task. Best effort.
    fn abort(
        &mut self,
        worker: WorkerId,
        job: JobId,
        task: TaskId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Check whether `worker` (reachable at `location`) still holds
    /// `reference`. The future must not borrow the backend: the runtime
    /// drives it on its own task.
    fn probe(&self, worker: &WorkerId, location: &str, reference: &RefId) -> ProbeFuture;
}

/// Requests forwarded by [`ChannelBackend`].
#[derive(Debug)]
pub enum BackendRequest {
    Dispatch(Assignment),
    Abort {
        worker: WorkerId,
        job: JobId,
        task: TaskId,
    },
    Probe {
        worker: WorkerId,
        location: String,
        reference: RefId,
        reply: oneshot::Sender<bool>,
    },
}

/// Backend that forwards everything over an mpsc channel.
pub struct ChannelBackend {
    tx: mpsc::Sender<BackendRequest>,
}

impl ChannelBackend {
    /// Create a backend and the receiving end its requests arrive on.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<BackendRequest>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

impl DispatchBackend for ChannelBackend {
    fn dispatch(
        &mut self,
        assignments: Vec<Assignment>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        // Clone the sender so the future doesn't borrow `self` across `await`.
        let tx = self.tx.clone();

        Box::pin(async move {
            for assignment in assignments {
                tx.send(BackendRequest::Dispatch(assignment))
                    .await
                    .map_err(Error::from)?;
            }
            Ok(())
        })
    }

    fn abort(
        &mut self,
        worker: WorkerId,
        job: JobId,
        task: TaskId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.tx.clone();
        Box::pin(async move {
            tx.send(BackendRequest::Abort { worker, job, task })
                .await
                .map_err(Error::from)?;
            Ok(())
        })
    }

    fn probe(&self, worker: &WorkerId, location: &str, reference: &RefId) -> ProbeFuture {
        let tx = self.tx.clone();
        let (reply, answer) = oneshot::channel();
        let request = BackendRequest::Probe {
            worker: worker.clone(),
            location: location.to_string(),
            reference: reference.clone(),
            reply,
        };

        Box::pin(async move {
            if tx.send(request).await.is_err() {
                debug!("probe channel closed; treating location as gone");
                return false;
            }
            // An unanswered probe counts as a dead location.
            answer.await.unwrap_or(false)
        })
    }
}
