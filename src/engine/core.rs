// src/engine/core.rs

//! Pure master state machine.
//!
//! [`CoreMaster`] owns every job, the worker pool and the scheduler. Each
//! operation mutates that state synchronously and returns a [`CoreStep`]
//! describing the IO the shell should perform (dispatch, abort, probe,
//! journal, notify waiters). It has no channels, no tokio types and performs
//! no IO, so all master semantics are testable without a runtime.
//!
//! Mutating operations never place tasks themselves: they only request a
//! scheduling pass, and the shell calls [`CoreMaster::schedule`] once no
//! further event is immediately pending.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::errors::{Result, TaskweaveError};
use crate::graph::GraphDelta;
use crate::recovery::{FailureReason, JournalRecord};
use crate::reference::{Reference, WorkerId};
use crate::sched::{Scheduler, WorkerPool, WorkerSpec, policy_for};
use crate::task::{Job, JobId, JobStatus, TaskDescriptor, TaskId, TaskState, TaskStatus};
use crate::types::PlacementPolicyKind;

use super::event_handlers::{
    absorb, fail_permanently, handle_completion, handle_probe_result, handle_worker_failure,
};
use super::{CompletionReport, CoreCommand, CoreStep, MasterSettings, ProbeResult};

#[derive(Debug)]
pub struct CoreMaster {
    jobs: BTreeMap<JobId, Job>,
    pool: WorkerPool,
    scheduler: Scheduler,
    settings: MasterSettings,
    clock: SharedClock,
}

impl CoreMaster {
    pub fn new(settings: MasterSettings, clock: SharedClock) -> Self {
        Self {
            jobs: BTreeMap::new(),
            pool: WorkerPool::new(clock.clone()),
            scheduler: Scheduler::new(settings.rng_seed, settings.lottery),
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &MasterSettings {
        &self.settings
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    fn journaling(&self) -> bool {
        self.settings.journal_dir.is_some()
    }

    fn job_mut(&mut self, id: &JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| TaskweaveError::UnknownJob(id.clone()))
    }

    fn new_job(
        &self,
        id: JobId,
        root: &TaskDescriptor,
        policy: Option<PlacementPolicyKind>,
    ) -> Result<Job> {
        let kind = policy.unwrap_or(self.settings.default_policy);
        Job::new(
            id,
            root,
            policy_for(kind, self.settings.locality),
            self.settings.lottery.ewma_alpha,
            self.clock.clone(),
        )
    }

    /// Submit a root task under a fresh job id and ask for its result.
    pub fn submit_job(
        &mut self,
        root: TaskDescriptor,
        policy: Option<PlacementPolicyKind>,
    ) -> Result<(JobId, CoreStep)> {
        let id = JobId::generate();
        let step = self.submit_job_with_id(id.clone(), root, policy)?;
        Ok((id, step))
    }

    /// Like [`Self::submit_job`] with a caller-chosen id.
    pub fn submit_job_with_id(
        &mut self,
        id: JobId,
        root: TaskDescriptor,
        policy: Option<PlacementPolicyKind>,
    ) -> Result<CoreStep> {
        if self.jobs.contains_key(&id) {
            return Err(TaskweaveError::InvalidTask(format!("job '{id}' already exists")));
        }
        root.validate()?;

        let mut job = self.new_job(id.clone(), &root, policy)?;
        let result = job.result.clone();
        let delta = job.graph.reduce_for_outputs(std::slice::from_ref(&result))?;

        info!(
            job = %id,
            root = %root.task_id,
            result = %result,
            policy = %job.policy_kind(),
            "job submitted"
        );

        let mut step = CoreStep::default();
        if self.journaling() {
            step.push(CoreCommand::AppendJournal {
                job: id.clone(),
                records: vec![JournalRecord::Task(root)],
            });
        }
        absorb(&mut job, delta, self.clock.now(), &mut step);
        self.jobs.insert(id, job);
        Ok(step)
    }

    /// Rebuild a job from its journal and ask for its result again.
    ///
    /// Replayed records are not journaled a second time.
    pub fn restore_job(&mut self, id: JobId, records: Vec<JournalRecord>) -> Result<CoreStep> {
        if self.jobs.contains_key(&id) {
            return Err(TaskweaveError::Journal(format!("job '{id}' is already loaded")));
        }

        let mut records = records.into_iter();
        let root = match records.next() {
            Some(JournalRecord::Task(root)) => root,
            _ => {
                return Err(TaskweaveError::Journal(format!(
                    "journal of job '{id}' does not start with a task record"
                )));
            }
        };

        let mut job = self.new_job(id.clone(), &root, None)?;
        let mut delta = GraphDelta::default();
        let mut replayed = 1usize;
        for record in records {
            match record {
                JournalRecord::Task(desc) => delta.merge(job.graph.restore(&desc)?),
                JournalRecord::Reference(r) => delta.merge(job.graph.publish(&r, None)),
            }
            replayed += 1;
        }

        let result = job.result.clone();
        delta.merge(job.graph.reduce_for_outputs(std::slice::from_ref(&result))?);

        info!(
            job = %id,
            records = replayed,
            tasks = job.graph.task_count(),
            "job restored from journal"
        );

        let mut step = CoreStep::default();
        absorb(&mut job, delta, self.clock.now(), &mut step);
        self.jobs.insert(id, job);
        Ok(step)
    }

    /// Apply a worker's completion batch atomically.
    pub fn report_completion(&mut self, report: CompletionReport) -> Result<CoreStep> {
        let now = self.clock.now();
        let max = self.settings.max_worker_failures;
        let journaling = self.journaling();
        let job = self
            .jobs
            .get_mut(&report.job)
            .ok_or_else(|| TaskweaveError::UnknownJob(report.job.clone()))?;
        handle_completion(job, &mut self.pool, report, max, journaling, now)
    }

    /// Out-of-band publication of references into a job's graph.
    pub fn publish(&mut self, job_id: &JobId, references: Vec<Reference>) -> Result<CoreStep> {
        let now = self.clock.now();
        let journaling = self.journaling();
        let job = self.job_mut(job_id)?;

        let mut step = CoreStep::default();
        let mut delta = GraphDelta::default();
        for r in &references {
            delta.merge(job.graph.publish(r, None));
        }
        if journaling && !references.is_empty() {
            step.push(CoreCommand::AppendJournal {
                job: job_id.clone(),
                records: references.into_iter().map(JournalRecord::Reference).collect(),
            });
        }
        absorb(job, delta, now, &mut step);
        Ok(step)
    }

    pub fn register_worker(&mut self, spec: WorkerSpec) -> CoreStep {
        self.pool.register(spec);
        let mut step = CoreStep::default();
        step.request_schedule();
        step
    }

    pub fn heartbeat(&mut self, worker: &WorkerId) -> Result<()> {
        if self.pool.heartbeat(worker) {
            Ok(())
        } else {
            Err(TaskweaveError::UnknownWorker(worker.clone()))
        }
    }

    /// Deregister every worker whose heartbeat is older than the timeout.
    pub fn check_heartbeats(&mut self) -> CoreStep {
        let mut step = CoreStep::default();
        for worker in self.pool.expired(self.settings.heartbeat_timeout) {
            warn!(%worker, timeout = ?self.settings.heartbeat_timeout, "worker missed heartbeats");
            match self.deregister_worker(&worker) {
                Ok(s) => step.merge(s),
                Err(e) => warn!(%worker, error = %e, "failed to deregister worker"),
            }
        }
        step
    }

    /// Remove a worker.
    ///
    /// Its assigned tasks fail with `WORKER_FAILED` (counted against the
    /// retry bound). Tasks queued on it that are pinned there by a `Fixed`
    /// input fail with `LOST_FIXED_OBJECT`; its other queued tasks go back
    /// to the backlog.
    pub fn deregister_worker(&mut self, worker: &WorkerId) -> Result<CoreStep> {
        let now = self.clock.now();
        let max = self.settings.max_worker_failures;
        let removed = self
            .pool
            .deregister(worker)
            .ok_or_else(|| TaskweaveError::UnknownWorker(worker.clone()))?;

        let mut step = CoreStep::default();

        let in_flight: Vec<(JobId, TaskId)> = removed.assignments().cloned().collect();
        for (job_id, tid) in in_flight {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            let still_there = job.graph.task(&tid).is_some_and(|t| {
                t.state == TaskState::Assigned && t.assigned_worker.as_ref() == Some(worker)
            });
            if still_there {
                handle_worker_failure(
                    job,
                    &tid,
                    Some(format!("worker {worker} was lost")),
                    max,
                    now,
                    &mut step,
                )?;
            }
        }

        for job in self.jobs.values_mut() {
            let pinned: Vec<(TaskId, Reference)> = job
                .graph
                .tasks()
                .filter(|t| t.is_queueable() || t.state == TaskState::Runnable)
                .filter_map(|t| {
                    t.bound_inputs().find_map(|r| match r {
                        Reference::Fixed { location, .. } if location == worker => {
                            Some((t.id.clone(), r.clone()))
                        }
                        _ => None,
                    })
                })
                .collect();

            for (tid, fixed) in pinned {
                let tombstone = Reference::Tombstone {
                    id: fixed.id().clone(),
                    dead: BTreeSet::from([worker.clone()]),
                };
                let delta = job.graph.publish(&tombstone, None);
                absorb(job, delta, now, &mut step);
                fail_permanently(
                    job,
                    &tid,
                    FailureReason::LostFixedObject,
                    Some(format!("fixed input {} was on {worker}", fixed.id())),
                    now,
                    &mut step,
                )?;
            }

            for (class, tid) in job.queues.remove_worker(worker) {
                job.queues.push_backlog(&class, tid);
            }
        }

        step.request_schedule();
        Ok(step)
    }

    /// Cancel one task. The task is `ABORTED` at once; its worker is asked
    /// to stop on a best-effort basis.
    pub fn abort_task(&mut self, job_id: &JobId, tid: &TaskId) -> Result<CoreStep> {
        let now = self.clock.now();
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| TaskweaveError::UnknownJob(job_id.clone()))?;
        let class = job
            .graph
            .task(tid)
            .map(|t| t.scheduling_class.clone())
            .ok_or_else(|| TaskweaveError::UnknownTask(tid.clone()))?;

        let (worker, delta) = job.graph.abort_task(tid)?;
        let mut step = CoreStep::default();
        if let Some(worker) = worker {
            self.pool.release(&worker, &class, job_id, tid);
            step.push(CoreCommand::AbortOnWorker {
                worker,
                job: job_id.clone(),
                task: tid.clone(),
            });
            step.request_schedule();
        }
        info!(job = %job_id, task = %tid, "task aborted");
        absorb(job, delta, now, &mut step);
        Ok(step)
    }

    /// Cancel every live task of a job and resolve its result to
    /// `Error(ABORTED)` if nothing else has.
    pub fn abort_job(&mut self, job_id: &JobId) -> Result<CoreStep> {
        let live: Vec<TaskId> = self
            .jobs
            .get(job_id)
            .ok_or_else(|| TaskweaveError::UnknownJob(job_id.clone()))?
            .graph
            .tasks()
            .filter(|t| !t.is_terminal() || t.pending_probes > 0)
            .map(|t| t.id.clone())
            .collect();

        let mut step = CoreStep::default();
        for tid in &live {
            step.merge(self.abort_task(job_id, tid)?);
        }

        let now = self.clock.now();
        let job = self.job_mut(job_id)?;
        if job.is_running() {
            let result = Reference::error(
                job.result.clone(),
                FailureReason::Aborted.to_string(),
                Some("job aborted".to_string()),
            );
            let delta = job.graph.publish(&result, None);
            absorb(job, delta, now, &mut step);
        }
        info!(job = %job_id, aborted = live.len(), "job aborted");
        Ok(step)
    }

    pub fn probe_completed(&mut self, result: ProbeResult) -> Result<CoreStep> {
        let now = self.clock.now();
        let job = self.job_mut(&result.job)?;
        let mut step = CoreStep::default();
        handle_probe_result(job, result, now, &mut step)?;
        Ok(step)
    }

    /// Queue newly runnable tasks and fill free worker slots.
    pub fn schedule(&mut self) -> CoreStep {
        let now = self.clock.now();
        let mut step = CoreStep::default();

        for job in self.jobs.values_mut().filter(|j| j.is_running()) {
            if job.pending.is_empty() {
                continue;
            }
            let outcome = self.scheduler.enqueue(job, &self.pool);

            for (tid, fixed, location) in outcome.lost_fixed {
                let tombstone = Reference::Tombstone {
                    id: fixed.clone(),
                    dead: BTreeSet::from([location.clone()]),
                };
                let delta = job.graph.publish(&tombstone, None);
                absorb(job, delta, now, &mut step);
                if let Err(e) = fail_permanently(
                    job,
                    &tid,
                    FailureReason::LostFixedObject,
                    Some(format!("fixed input {fixed} was on {location}")),
                    now,
                    &mut step,
                ) {
                    warn!(job = %job.id, task = %tid, error = %e, "failed to fail pinned task");
                }
            }

            // The data is still there; only the task cannot go to it.
            for (tid, fixed, location) in outcome.refused_fixed {
                if let Err(e) = fail_permanently(
                    job,
                    &tid,
                    FailureReason::LostFixedObject,
                    Some(format!("{location} holds fixed input {fixed} but cannot run the task")),
                    now,
                    &mut step,
                ) {
                    warn!(job = %job.id, task = %tid, error = %e, "failed to fail pinned task");
                }
            }
        }

        let assignments = self.scheduler.assign(&mut self.jobs, &mut self.pool);
        if !assignments.is_empty() {
            debug!(count = assignments.len(), "dispatching assignments");
            step.push(CoreCommand::Dispatch(assignments));
        }

        // Losing pinned tasks may have made others runnable.
        let again = self.jobs.values().any(|j| j.is_running() && !j.pending.is_empty());
        if again {
            step.request_schedule();
        } else {
            step.commands
                .retain(|c| !matches!(c, CoreCommand::RequestSchedule));
        }
        step
    }

    pub fn job_status(&self, job_id: &JobId) -> Result<JobStatus> {
        self.jobs
            .get(job_id)
            .map(Job::status)
            .ok_or_else(|| TaskweaveError::UnknownJob(job_id.clone()))
    }

    pub fn task_status(&self, job_id: &JobId, tid: &TaskId) -> Result<TaskStatus> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| TaskweaveError::UnknownJob(job_id.clone()))?;
        job.graph
            .task(tid)
            .map(|t| t.status())
            .ok_or_else(|| TaskweaveError::UnknownTask(tid.clone()))
    }

    /// The job's result, once it has finished.
    pub fn job_result(&self, job_id: &JobId) -> Result<Option<Reference>> {
        self.jobs
            .get(job_id)
            .map(|j| j.result_value().cloned())
            .ok_or_else(|| TaskweaveError::UnknownJob(job_id.clone()))
    }

    /// Drop a finished job and its graph.
    pub fn discard_job(&mut self, job_id: &JobId) -> Result<()> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| TaskweaveError::UnknownJob(job_id.clone()))?;
        if job.is_running() {
            return Err(TaskweaveError::InvalidTask(format!(
                "job '{job_id}' is still running"
            )));
        }
        self.jobs.remove(job_id);
        debug!(job = %job_id, "job discarded");
        Ok(())
    }
}
