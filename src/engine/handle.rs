// src/engine/handle.rs

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::errors::{Result, TaskweaveError};
use crate::reference::{Reference, WorkerId};
use crate::sched::WorkerSpec;
use crate::task::{JobId, JobStatus, TaskDescriptor, TaskId, TaskStatus};
use crate::types::PlacementPolicyKind;

use super::{CompletionReport, MasterEvent, Reply};

/// Cloneable client of a running master.
///
/// Every call is a request/reply round trip over the runtime's event
/// channel. Calls fail with [`TaskweaveError::RuntimeClosed`] once the
/// runtime has stopped.
#[derive(Debug, Clone)]
pub struct MasterHandle {
    tx: mpsc::Sender<MasterEvent>,
}

impl MasterHandle {
    pub fn new(tx: mpsc::Sender<MasterEvent>) -> Self {
        Self { tx }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> MasterEvent) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| TaskweaveError::RuntimeClosed)?;
        rx.await.map_err(|_| TaskweaveError::RuntimeClosed)?
    }

    pub async fn submit_job(
        &self,
        root: TaskDescriptor,
        policy: Option<PlacementPolicyKind>,
    ) -> Result<JobId> {
        self.request(|reply| MasterEvent::SubmitJob {
            root,
            policy,
            reply,
        })
        .await
    }

    pub async fn report_completion(&self, report: CompletionReport) -> Result<()> {
        self.request(|reply| MasterEvent::ReportCompletion { report, reply })
            .await
    }

    pub async fn publish(&self, job: JobId, references: Vec<Reference>) -> Result<()> {
        self.request(|reply| MasterEvent::Publish {
            job,
            references,
            reply,
        })
        .await
    }

    pub async fn register_worker(&self, spec: WorkerSpec) -> Result<()> {
        self.request(|reply| MasterEvent::RegisterWorker { spec, reply })
            .await
    }

    pub async fn heartbeat(&self, worker: WorkerId) -> Result<()> {
        self.request(|reply| MasterEvent::Heartbeat { worker, reply })
            .await
    }

    pub async fn deregister_worker(&self, worker: WorkerId) -> Result<()> {
        self.request(|reply| MasterEvent::DeregisterWorker { worker, reply })
            .await
    }

    pub async fn abort_task(&self, job: JobId, task: TaskId) -> Result<()> {
        self.request(|reply| MasterEvent::AbortTask { job, task, reply })
            .await
    }

    pub async fn abort_job(&self, job: JobId) -> Result<()> {
        self.request(|reply| MasterEvent::AbortJob { job, reply })
            .await
    }

    pub async fn job_status(&self, job: JobId) -> Result<JobStatus> {
        self.request(|reply| MasterEvent::JobStatus { job, reply })
            .await
    }

    pub async fn task_status(&self, job: JobId, task: TaskId) -> Result<TaskStatus> {
        self.request(|reply| MasterEvent::TaskStatus { job, task, reply })
            .await
    }

    /// Wait up to `timeout` for the job to finish.
    ///
    /// Returns `Ok(None)` if the job is still running when the timeout
    /// expires.
    pub async fn wait_result(&self, job: JobId, timeout: Duration) -> Result<Option<Reference>> {
        match tokio::time::timeout(
            timeout,
            self.request(|reply| MasterEvent::WaitResult { job, reply }),
        )
        .await
        {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Ask the runtime to stop. Does not wait for it to exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(MasterEvent::ShutdownRequested)
            .await
            .map_err(|_| TaskweaveError::RuntimeClosed)
    }
}
