// src/engine/event_handlers.rs

//! Commit and failure handling applied by the core to a single job.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::errors::{Result, TaskweaveError};
use crate::graph::GraphDelta;
use crate::recovery::{
    FailedBinding, FailureKind, FailureReason, JournalRecord, RetryDecision, retry_decision,
};
use crate::reference::{RefId, Reference, WorkerId};
use crate::sched::{Assignment, WorkerPool};
use crate::task::{Job, JobId, JobState, TaskEvent, TaskId, TaskState};

use super::{CompletionReport, ProbeResult, TaskOutcome};

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Hand these assignments to the dispatch backend.
    Dispatch(Vec<Assignment>),
    /// Ask a worker to stop running a task. Best effort.
    AbortOnWorker {
        worker: WorkerId,
        job: JobId,
        task: TaskId,
    },
    /// Ask `worker` (at `location`) whether it still holds `reference`.
    ProbeLocation {
        job: JobId,
        task: TaskId,
        reference: RefId,
        worker: WorkerId,
        location: String,
    },
    AppendJournal {
        job: JobId,
        records: Vec<JournalRecord>,
    },
    /// The job's result reached a terminal value.
    JobFinished {
        job: JobId,
        state: JobState,
        result: Reference,
    },
    /// Runnable work appeared or capacity freed up; run `schedule()` soon.
    RequestSchedule,
}

/// Commands returned by one core operation.
#[derive(Debug, Clone, Default)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
}

impl CoreStep {
    pub fn push(&mut self, command: CoreCommand) {
        self.commands.push(command);
    }

    pub fn merge(&mut self, other: CoreStep) {
        self.commands.extend(other.commands);
    }

    pub fn request_schedule(&mut self) {
        if !self.wants_schedule() {
            self.commands.push(CoreCommand::RequestSchedule);
        }
    }

    pub fn wants_schedule(&self) -> bool {
        self.commands
            .iter()
            .any(|c| matches!(c, CoreCommand::RequestSchedule))
    }

    /// All assignments dispatched by this step.
    pub fn assignments(&self) -> Vec<&Assignment> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::Dispatch(a) => Some(a),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Fold a graph delta into the job: remember new runnable tasks and finish
/// the job when its result reaches a terminal value.
pub fn absorb(job: &mut Job, delta: GraphDelta, now: Instant, step: &mut CoreStep) {
    if !delta.runnable.is_empty() {
        debug!(job = %job.id, runnable = ?delta.runnable, "tasks became runnable");
        job.pending.extend(delta.runnable);
        step.request_schedule();
    }

    if !delta.failed.is_empty() {
        debug!(job = %job.id, failed = ?delta.failed, "tasks failed");
    }

    for value in delta.watched {
        if value.id() != &job.result || !job.is_running() || !value.is_terminal() {
            continue;
        }
        finish_job(job, value, now, step);
    }
}

fn finish_job(job: &mut Job, result: Reference, now: Instant, step: &mut CoreStep) {
    let state = match &result {
        Reference::Error { reason, .. } if reason == FailureReason::Aborted.as_str() => {
            JobState::Aborted
        }
        Reference::Error { .. } => JobState::Failed,
        _ => JobState::Committed,
    };
    job.state = state;
    job.finished_at = Some(now);

    match state {
        JobState::Committed => info!(job = %job.id, result = %result, "job committed"),
        _ => warn!(job = %job.id, state = ?state, result = %result, "job finished unsuccessfully"),
    }

    step.push(CoreCommand::JobFinished {
        job: job.id.clone(),
        state,
        result,
    });
}

/// Apply one completion batch.
///
/// Reports for tasks that are not `ASSIGNED` to the reporting worker are
/// stale (aborted tasks, workers already declared dead) and are ignored.
pub fn handle_completion(
    job: &mut Job,
    pool: &mut WorkerPool,
    report: CompletionReport,
    max_worker_failures: u32,
    journaling: bool,
    now: Instant,
) -> Result<CoreStep> {
    let mut step = CoreStep::default();
    let tid = report.task;

    let task = job
        .graph
        .task(&tid)
        .ok_or_else(|| TaskweaveError::UnknownTask(tid.clone()))?;

    if task.state != TaskState::Assigned || task.assigned_worker.as_ref() != Some(&report.worker) {
        warn!(
            job = %job.id,
            task = %tid,
            worker = %report.worker,
            state = %task.state,
            "stale completion report ignored"
        );
        return Ok(step);
    }

    let class = task.scheduling_class.clone();
    let started = task.assigned_at;
    pool.release(&report.worker, &class, &job.id, &tid);
    step.request_schedule();

    match report.outcome {
        TaskOutcome::Committed { spawned, published } => {
            match job.graph.commit_task(&tid, &spawned, &published) {
                Ok(delta) => {
                    if let Some(started) = started {
                        let millis = now.saturating_duration_since(started).as_secs_f64() * 1000.0;
                        job.record_duration(millis);
                    }
                    debug!(
                        job = %job.id,
                        task = %tid,
                        spawned = spawned.len(),
                        published = published.len(),
                        "task committed"
                    );
                    if journaling && (!spawned.is_empty() || !published.is_empty()) {
                        let records = spawned
                            .into_iter()
                            .map(JournalRecord::Task)
                            .chain(published.into_iter().map(JournalRecord::Reference))
                            .collect();
                        step.push(CoreCommand::AppendJournal {
                            job: job.id.clone(),
                            records,
                        });
                    }
                    absorb(job, delta, now, &mut step);
                }
                Err(TaskweaveError::InvalidTask(msg)) => {
                    warn!(job = %job.id, task = %tid, %msg, "completion batch rejected");
                    fail_permanently(job, &tid, FailureReason::RuntimeException, Some(msg), now, &mut step)?;
                }
                Err(e) => return Err(e),
            }
        }
        TaskOutcome::Failed {
            reason,
            detail,
            failed_bindings,
        } => match reason.kind() {
            FailureKind::TransientWorkerFailure => {
                handle_worker_failure(job, &tid, detail, max_worker_failures, now, &mut step)?;
            }
            FailureKind::MissingInputFailure => {
                handle_missing_input(job, pool, &tid, &failed_bindings, now, &mut step)?;
            }
            FailureKind::PermanentTaskFailure => {
                fail_permanently(job, &tid, reason, detail, now, &mut step)?;
            }
        },
    }

    Ok(step)
}

/// Publish errors on a task's outputs; no retry.
pub fn fail_permanently(
    job: &mut Job,
    tid: &TaskId,
    reason: FailureReason,
    detail: Option<String>,
    now: Instant,
    step: &mut CoreStep,
) -> Result<()> {
    warn!(job = %job.id, task = %tid, %reason, ?detail, "task failed permanently");
    let delta = job.graph.fail_task(tid, reason, detail)?;
    absorb(job, delta, now, step);
    Ok(())
}

/// Count a `WORKER_FAILED` against the retry bound; requeue or give up.
pub fn handle_worker_failure(
    job: &mut Job,
    tid: &TaskId,
    detail: Option<String>,
    max_worker_failures: u32,
    now: Instant,
    step: &mut CoreStep,
) -> Result<()> {
    let task = job
        .graph
        .task_mut(tid)
        .ok_or_else(|| TaskweaveError::UnknownTask(tid.clone()))?;
    task.retry_count += 1;
    let failures = task.retry_count;

    match retry_decision(failures, max_worker_failures) {
        RetryDecision::Retry { attempt } => {
            warn!(job = %job.id, task = %tid, failures, attempt, "worker failed; retrying task");
            let delta = job.graph.restart_task(tid, TaskEvent::Retrying { attempt })?;
            absorb(job, delta, now, step);
            Ok(())
        }
        RetryDecision::GiveUp => fail_permanently(
            job,
            tid,
            FailureReason::WorkerFailed,
            detail.or_else(|| Some(format!("worker failed {failures} times"))),
            now,
            step,
        ),
    }
}

/// Self-healing after a `MISSING_INPUT` report.
///
/// Locations of workers that are no longer registered are tombstoned right
/// away. The others are probed; the task is re-reduced once every probe has
/// answered. A tombstone that empties a reference's locations downgrades it
/// to `Future`, so the re-reduction re-runs its producer. A reference with
/// no producer settles as `Error(MISSING_INPUT)` instead.
pub fn handle_missing_input(
    job: &mut Job,
    pool: &WorkerPool,
    tid: &TaskId,
    bindings: &[FailedBinding],
    now: Instant,
    step: &mut CoreStep,
) -> Result<()> {
    let mut delta = GraphDelta::default();
    let mut probes = Vec::new();

    for binding in bindings {
        let locations: BTreeSet<WorkerId> = if binding.locations.is_empty() {
            job.graph
                .reference(&binding.reference)
                .map(Reference::locations)
                .unwrap_or_default()
        } else {
            binding.locations.clone()
        };

        for worker in locations {
            match pool.get(&worker) {
                Some(w) => probes.push((binding.reference.clone(), worker, w.spec.location.clone())),
                None => {
                    debug!(reference = %binding.reference, %worker, "location is gone; tombstoning");
                    delta.merge(tombstone(job, &binding.reference, worker));
                }
            }
        }
    }

    let task = job
        .graph
        .task_mut(tid)
        .ok_or_else(|| TaskweaveError::UnknownTask(tid.clone()))?;
    task.assigned_worker = None;
    task.transition(
        TaskState::Failed,
        now,
        TaskEvent::Failed {
            reason: FailureReason::MissingInput.to_string(),
        },
    );

    warn!(
        job = %job.id,
        task = %tid,
        lost = bindings.len(),
        probes = probes.len(),
        "task could not fetch inputs"
    );

    if probes.is_empty() {
        delta.merge(job.graph.restart_task(tid, TaskEvent::Restarted)?);
    } else {
        task.pending_probes = probes.len();
        task.record(now, TaskEvent::AwaitingProbes { probes: probes.len() });
        for (reference, worker, location) in probes {
            step.push(CoreCommand::ProbeLocation {
                job: job.id.clone(),
                task: tid.clone(),
                reference,
                worker,
                location,
            });
        }
    }

    absorb(job, delta, now, step);
    Ok(())
}

/// Forget `worker`'s copy of `id`.
///
/// When that was the last copy and no task produces `id`, it can never come
/// back: it resolves to an error so its consumers fail instead of blocking.
fn tombstone(job: &mut Job, id: &RefId, worker: WorkerId) -> GraphDelta {
    let mut delta = job.graph.publish(
        &Reference::Tombstone {
            id: id.clone(),
            dead: BTreeSet::from([worker]),
        },
        None,
    );

    let orphaned = job.graph.reference(id).is_some_and(Reference::is_future)
        && job.graph.producer_of(id).is_none();
    if orphaned {
        warn!(job = %job.id, reference = %id, "last copy lost and nothing can produce it again");
        delta.merge(job.graph.publish(
            &Reference::error(
                id.clone(),
                FailureReason::MissingInput.to_string(),
                Some("lost with no producer".to_string()),
            ),
            None,
        ));
    }
    delta
}

/// Fold one probe answer in; re-reduce the task after the last one.
pub fn handle_probe_result(
    job: &mut Job,
    result: ProbeResult,
    now: Instant,
    step: &mut CoreStep,
) -> Result<()> {
    let mut delta = GraphDelta::default();

    if !result.present {
        debug!(reference = %result.reference, worker = %result.worker, "probe: data gone");
        delta.merge(tombstone(job, &result.reference, result.worker.clone()));
    }

    let task = job
        .graph
        .task_mut(&result.task)
        .ok_or_else(|| TaskweaveError::UnknownTask(result.task.clone()))?;

    if task.pending_probes == 0 {
        debug!(task = %result.task, "probe result for task not awaiting probes");
    } else {
        task.pending_probes -= 1;
        if task.pending_probes == 0 && task.state == TaskState::Failed && job.is_running() {
            info!(job = %job.id, task = %result.task, "probes complete; re-reducing task");
            delta.merge(job.graph.restart_task(&result.task, TaskEvent::Restarted)?);
        }
    }

    absorb(job, delta, now, step);
    Ok(())
}
