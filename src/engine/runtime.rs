// src/engine/runtime.rs

use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::exec::DispatchBackend;
use crate::recovery::{JournalRecord, JournalWriter};
use crate::reference::Reference;
use crate::task::JobId;

use super::core::CoreMaster;
use super::{CoreCommand, CoreStep, MasterEvent, ProbeResult, Reply};

/// Drives the master core in response to `MasterEvent`s, and delegates
/// dispatch to a `DispatchBackend`.
///
/// This is a pure IO shell around `CoreMaster`, which contains all the
/// master semantics. This struct handles async IO: reading events from the
/// channel, dispatching assignments, running location probes, writing the
/// journal and answering result waiters.
pub struct Runtime<B: DispatchBackend> {
    core: CoreMaster,
    event_rx: mpsc::Receiver<MasterEvent>,
    /// Used by probe tasks to report back; weak so that dropping every
    /// `MasterHandle` still closes the channel.
    event_tx: mpsc::WeakSender<MasterEvent>,
    backend: B,
    journals: HashMap<JobId, JournalWriter>,
    waiters: HashMap<JobId, Vec<Reply<Reference>>>,
    schedule_requested: bool,
}

impl<B: DispatchBackend> fmt::Debug for Runtime<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("schedule_requested", &self.schedule_requested)
            .finish_non_exhaustive()
    }
}

impl<B: DispatchBackend> Runtime<B> {
    pub fn new(
        core: CoreMaster,
        event_rx: mpsc::Receiver<MasterEvent>,
        event_tx: &mpsc::Sender<MasterEvent>,
        backend: B,
    ) -> Self {
        Self {
            core,
            event_rx,
            event_tx: event_tx.downgrade(),
            backend,
            journals: HashMap::new(),
            waiters: HashMap::new(),
            schedule_requested: true,
        }
    }

    /// Main event loop.
    ///
    /// - Consumes `MasterEvent`s and answers their replies.
    /// - Checks worker heartbeats on a fixed interval.
    /// - Runs a scheduling pass whenever one was requested and no event is
    ///   immediately pending, so replies are never held up by placement.
    pub async fn run(mut self) -> Result<()> {
        info!("taskweave master started");

        let mut heartbeat = tokio::time::interval(self.core.settings().heartbeat_check_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                event = self.event_rx.recv() => match event {
                    Some(MasterEvent::ShutdownRequested) => {
                        info!("shutdown requested; stopping master");
                        break;
                    }
                    Some(event) => self.handle_event(event).await?,
                    None => {
                        info!("master event channel closed; exiting");
                        break;
                    }
                },

                _ = heartbeat.tick() => {
                    let step = self.core.check_heartbeats();
                    self.execute(step).await?;
                }

                _ = std::future::ready(()), if self.schedule_requested => {
                    self.schedule_requested = false;
                    let step = self.core.schedule();
                    self.execute(step).await?;
                }
            }
        }

        info!("master runtime exiting");
        Ok(())
    }

    async fn handle_event(&mut self, event: MasterEvent) -> Result<()> {
        match event {
            MasterEvent::SubmitJob {
                root,
                policy,
                reply,
            } => {
                let answer = match self.core.submit_job(root, policy) {
                    Ok((id, step)) => {
                        self.execute(step).await?;
                        Ok(id)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(answer);
            }
            MasterEvent::ReportCompletion { report, reply } => {
                let step = self.core.report_completion(report);
                let answer = self.settle(step).await?;
                let _ = reply.send(answer);
            }
            MasterEvent::Publish {
                job,
                references,
                reply,
            } => {
                let step = self.core.publish(&job, references);
                let answer = self.settle(step).await?;
                let _ = reply.send(answer);
            }
            MasterEvent::RegisterWorker { spec, reply } => {
                let step = self.core.register_worker(spec);
                self.execute(step).await?;
                let _ = reply.send(Ok(()));
            }
            MasterEvent::Heartbeat { worker, reply } => {
                let _ = reply.send(self.core.heartbeat(&worker));
            }
            MasterEvent::DeregisterWorker { worker, reply } => {
                let step = self.core.deregister_worker(&worker);
                let answer = self.settle(step).await?;
                let _ = reply.send(answer);
            }
            MasterEvent::AbortTask { job, task, reply } => {
                let step = self.core.abort_task(&job, &task);
                let answer = self.settle(step).await?;
                let _ = reply.send(answer);
            }
            MasterEvent::AbortJob { job, reply } => {
                let step = self.core.abort_job(&job);
                let answer = self.settle(step).await?;
                let _ = reply.send(answer);
            }
            MasterEvent::JobStatus { job, reply } => {
                let _ = reply.send(self.core.job_status(&job));
            }
            MasterEvent::TaskStatus { job, task, reply } => {
                let _ = reply.send(self.core.task_status(&job, &task));
            }
            MasterEvent::WaitResult { job, reply } => match self.core.job_result(&job) {
                Ok(Some(result)) => {
                    let _ = reply.send(Ok(result));
                }
                Ok(None) => {
                    debug!(%job, "result waiter registered");
                    let waiting = self.waiters.entry(job).or_default();
                    // Callers that timed out have dropped their receiver.
                    waiting.retain(|w| !w.is_closed());
                    waiting.push(reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            MasterEvent::ProbeCompleted(result) => {
                let step = self.core.probe_completed(result);
                if let Err(e) = self.settle(step).await? {
                    warn!(error = %e, "probe result rejected");
                }
            }
            MasterEvent::ShutdownRequested => {}
        }
        Ok(())
    }

    /// Execute a core step if the operation succeeded; hand the operation's
    /// own error back for the reply. Only shell failures are fatal.
    async fn settle(&mut self, step: Result<CoreStep>) -> Result<Result<()>> {
        match step {
            Ok(step) => {
                self.execute(step).await?;
                Ok(Ok(()))
            }
            Err(e) => Ok(Err(e)),
        }
    }

    async fn execute(&mut self, step: CoreStep) -> Result<()> {
        for command in step.commands {
            self.execute_command(command).await?;
        }
        Ok(())
    }

    async fn execute_command(&mut self, command: CoreCommand) -> Result<()> {
        match command {
            CoreCommand::Dispatch(assignments) => {
                if assignments.is_empty() {
                    return Ok(());
                }
                let tasks: Vec<_> = assignments.iter().map(|a| a.task.as_str()).collect();
                debug!(?tasks, "dispatching");
                self.backend.dispatch(assignments).await?;
            }
            CoreCommand::AbortOnWorker { worker, job, task } => {
                if let Err(e) = self.backend.abort(worker.clone(), job, task).await {
                    warn!(%worker, error = %e, "abort request failed");
                }
            }
            CoreCommand::ProbeLocation {
                job,
                task,
                reference,
                worker,
                location,
            } => {
                let probe = self.backend.probe(&worker, &location, &reference);
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let present = probe.await;
                    let Some(tx) = tx.upgrade() else {
                        return;
                    };
                    let result = ProbeResult {
                        job,
                        task,
                        reference,
                        worker,
                        present,
                    };
                    let _ = tx.send(MasterEvent::ProbeCompleted(result)).await;
                });
            }
            CoreCommand::AppendJournal { job, records } => {
                self.append_journal(&job, &records);
            }
            CoreCommand::JobFinished { job, state, result } => {
                info!(%job, ?state, "job finished");
                for waiter in self.waiters.remove(&job).unwrap_or_default() {
                    let _ = waiter.send(Ok(result.clone()));
                }
                if let Some(writer) = self.journals.remove(&job) {
                    debug!(%job, path = %writer.path().display(), "journal closed");
                }
            }
            CoreCommand::RequestSchedule => {
                self.schedule_requested = true;
            }
        }
        Ok(())
    }

    /// Journal write failures are logged, not fatal: the job keeps running
    /// but may not be recoverable after a restart.
    fn append_journal(&mut self, job: &JobId, records: &[JournalRecord]) {
        let Some(dir) = self.core.settings().journal_dir.clone() else {
            return;
        };

        if !self.journals.contains_key(job) {
            match JournalWriter::open(&dir, job) {
                Ok(writer) => {
                    self.journals.insert(job.clone(), writer);
                }
                Err(e) => {
                    error!(%job, error = %e, "failed to open journal");
                    return;
                }
            }
        }

        if let Some(writer) = self.journals.get_mut(job) {
            if let Err(e) = writer.append(records) {
                error!(%job, path = %writer.path().display(), error = %e, "journal append failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::MasterSettings;
    use crate::exec::{BackendRequest, ChannelBackend};
    use crate::reference::RefId;
    use crate::task::{TaskDescriptor, TaskId};

    fn runtime(settings: MasterSettings) -> (Runtime<ChannelBackend>, mpsc::Receiver<BackendRequest>) {
        let settings = MasterSettings {
            rng_seed: Some(7),
            ..settings
        };
        let core = CoreMaster::new(settings, Arc::new(ManualClock::new()));
        let (tx, rx) = mpsc::channel(16);
        let (backend, requests) = ChannelBackend::new(16);
        (Runtime::new(core, rx, &tx, backend), requests)
    }

    fn root() -> TaskDescriptor {
        TaskDescriptor {
            task_id: TaskId::new("R"),
            handler: "noop".to_string(),
            dependencies: BTreeMap::new(),
            expected_outputs: vec![RefId::new("out")],
            task_private: None,
            scheduling_class: None,
        }
    }

    async fn submit(rt: &mut Runtime<ChannelBackend>) -> Result<JobId> {
        let (reply, rx) = oneshot::channel();
        rt.handle_event(MasterEvent::SubmitJob {
            root: root(),
            policy: None,
            reply,
        })
        .await?;
        rx.await.map_err(|_| crate::errors::TaskweaveError::RuntimeClosed)?
    }

    async fn abort(rt: &mut Runtime<ChannelBackend>, job: &JobId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        rt.handle_event(MasterEvent::AbortJob {
            job: job.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| crate::errors::TaskweaveError::RuntimeClosed)?
    }

    #[tokio::test]
    async fn abandoned_result_waiters_are_dropped() -> Result<()> {
        let (mut rt, _requests) = runtime(MasterSettings::default());
        let job = submit(&mut rt).await?;

        for _ in 0..3 {
            let (reply, rx) = oneshot::channel();
            rt.handle_event(MasterEvent::WaitResult {
                job: job.clone(),
                reply,
            })
            .await?;
            drop(rx);
        }
        let (reply, mut live) = oneshot::channel();
        rt.handle_event(MasterEvent::WaitResult {
            job: job.clone(),
            reply,
        })
        .await?;
        assert_eq!(rt.waiters.get(&job).map(Vec::len), Some(1));

        abort(&mut rt, &job).await?;
        assert!(rt.waiters.is_empty());
        assert!(matches!(live.try_recv(), Ok(Ok(Reference::Error { .. }))));
        Ok(())
    }

    #[tokio::test]
    async fn journal_writer_is_released_when_the_job_finishes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = MasterSettings {
            journal_dir: Some(dir.path().to_path_buf()),
            ..MasterSettings::default()
        };
        let (mut rt, _requests) = runtime(settings);

        let job = submit(&mut rt).await?;
        assert!(rt.journals.contains_key(&job));

        abort(&mut rt, &job).await?;
        assert!(rt.journals.is_empty());
        Ok(())
    }
}
