// src/sched/scheduler.rs

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::graph::TaskGraph;
use crate::reference::{RefId, Reference, WorkerId};
use crate::task::{Job, JobId, TaskId, TaskState};

use super::lottery::{LotterySettings, draw};
use super::worker_pool::{Worker, WorkerPool};

/// A task bound to a worker, ready to hand to the dispatch backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub job: JobId,
    pub task: TaskId,
    pub worker: WorkerId,
    /// Network location of the worker.
    pub location: String,
    pub handler: String,
    /// Local dependency name -> bound value.
    pub inputs: BTreeMap<String, Reference>,
    pub expected_outputs: Vec<RefId>,
    pub private: Option<Reference>,
    pub scheduling_class: String,
    /// 1 for the first run, incremented on every worker-failure retry.
    pub attempt: u32,
}

/// Result of an enqueue pass.
#[derive(Debug, Default)]
pub struct EnqueueOutcome {
    pub queued: usize,
    /// Tasks pinned by a `Fixed` input to a worker that is gone:
    /// `(task, fixed reference, location)`.
    pub lost_fixed: Vec<(TaskId, RefId, WorkerId)>,
    /// Tasks pinned to a live worker that cannot run their handler or has
    /// no slot in their class. Same shape as `lost_fixed`.
    pub refused_fixed: Vec<(TaskId, RefId, WorkerId)>,
}

/// Placement and assignment across all jobs.
///
/// Owns the only random number generator of the master so that a seeded
/// run places and draws identically every time.
#[derive(Debug)]
pub struct Scheduler {
    rng: StdRng,
    lottery: LotterySettings,
}

impl Scheduler {
    pub fn new(seed: Option<u64>, lottery: LotterySettings) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng, lottery }
    }

    /// Queue every task the job made runnable since the last pass.
    ///
    /// Pinned tasks go only to their worker's queue. Everything else goes to
    /// the candidate queues chosen by the job's policy and to the backlog.
    pub fn enqueue(&mut self, job: &mut Job, pool: &WorkerPool) -> EnqueueOutcome {
        let mut outcome = EnqueueOutcome::default();

        for tid in std::mem::take(&mut job.pending) {
            let Some(task) = job.graph.task(&tid) else {
                continue;
            };
            if task.state != TaskState::Runnable {
                continue;
            }
            let class = task.scheduling_class.clone();

            let pinned = task.bound_inputs().find_map(|r| match r {
                Reference::Fixed { id, location } => Some((id.clone(), location.clone())),
                _ => None,
            });

            let candidates = match pinned {
                Some((fixed, location)) => {
                    let Some(worker) = pool.get(&location) else {
                        outcome.lost_fixed.push((tid.clone(), fixed, location));
                        continue;
                    };
                    if !worker.accepts(&task.handler, &class) {
                        outcome.refused_fixed.push((tid.clone(), fixed, location));
                        continue;
                    }
                    job.queues.push_worker(&location, &class, tid.clone());
                    1
                }
                None => {
                    let eligible = pool.eligible(&task.handler, &class);
                    let candidates = job.policy.select(task, &eligible, &mut self.rng);
                    for worker in &candidates {
                        job.queues.push_worker(worker, &class, tid.clone());
                    }
                    job.queues.push_backlog(&class, tid.clone());
                    debug!(
                        job = %job.id,
                        task = %tid,
                        policy = %job.policy.kind(),
                        ?candidates,
                        "task queued"
                    );
                    candidates.len()
                }
            };

            job.graph.mark_queued(&tid, candidates);
            outcome.queued += 1;
        }

        outcome
    }

    /// Fill free worker slots.
    ///
    /// Two passes over the workers, in id order. First each class of each
    /// worker is filled from the worker's own queues (the job chosen by
    /// lottery among jobs with work there). Only then do workers still
    /// under capacity take from the class backlog, so a task is never
    /// stolen from a candidate that was about to run it.
    pub fn assign(
        &mut self,
        jobs: &mut BTreeMap<JobId, Job>,
        pool: &mut WorkerPool,
    ) -> Vec<Assignment> {
        let mut out = Vec::new();
        for source in [Source::OwnQueue, Source::Backlog] {
            for wid in pool.ids() {
                let classes: Vec<String> = match pool.get(&wid) {
                    Some(w) => w.classes().map(str::to_string).collect(),
                    None => continue,
                };
                for class in classes {
                    self.fill(jobs, pool, &wid, &class, source, &mut out);
                }
            }
        }
        out
    }

    fn fill(
        &mut self,
        jobs: &mut BTreeMap<JobId, Job>,
        pool: &mut WorkerPool,
        wid: &WorkerId,
        class: &str,
        source: Source,
        out: &mut Vec<Assignment>,
    ) {
        loop {
            let Some(worker) = pool.get(wid) else {
                return;
            };
            if worker.free_slots(class) == 0 {
                return;
            }
            let location = worker.spec.location.clone();
            let next = match source {
                Source::OwnQueue => self.next_own(jobs, worker, class),
                Source::Backlog => self.next_stolen(jobs, worker, class),
            };
            let Some((job_id, tid)) = next else {
                return;
            };
            let Some(job) = jobs.get_mut(&job_id) else {
                return;
            };
            let Some(assignment) = build_assignment(job, &tid, wid, location) else {
                continue;
            };
            job.graph.mark_assigned(&tid, wid);
            pool.assign(wid, class, &job_id, &tid);

            debug!(
                job = %job_id,
                task = %tid,
                worker = %wid,
                class = %class,
                attempt = assignment.attempt,
                "task assigned"
            );
            out.push(assignment);
        }
    }

    /// Next task from `worker`'s own queues, the job drawn by lottery.
    fn next_own(
        &mut self,
        jobs: &mut BTreeMap<JobId, Job>,
        worker: &Worker,
        class: &str,
    ) -> Option<(JobId, TaskId)> {
        let budget = self.lottery.ticket_budget;

        let mut own: Vec<(JobId, u64)> = Vec::new();
        for job in jobs.values_mut().filter(|j| j.is_running()) {
            let tickets = job.tickets(budget);
            let graph = &job.graph;
            let head = job.queues.peek_worker(worker.id(), class, |t| queueable(graph, t));
            if head.is_some_and(|t| runnable_on(graph, t, worker)) {
                own.push((job.id.clone(), tickets));
            }
        }

        let i = draw(&own, &mut self.rng)?;
        let job_id = own.swap_remove(i).0;
        let tid = jobs.get_mut(&job_id)?.queues.pop_worker(worker.id(), class)?;
        Some((job_id, tid))
    }

    /// Next task `worker` can take from the class backlog.
    fn next_stolen(
        &mut self,
        jobs: &mut BTreeMap<JobId, Job>,
        worker: &Worker,
        class: &str,
    ) -> Option<(JobId, TaskId)> {
        let budget = self.lottery.ticket_budget;

        let mut stealable: Vec<((JobId, usize), u64)> = Vec::new();
        for job in jobs.values_mut().filter(|j| j.is_running()) {
            let tickets = job.tickets(budget);
            let graph = &job.graph;
            let index = job.queues.find_backlog(
                class,
                |t| queueable(graph, t),
                |t| runnable_on(graph, t, worker),
            );
            if let Some(index) = index {
                stealable.push(((job.id.clone(), index), tickets));
            }
        }

        let i = draw(&stealable, &mut self.rng)?;
        let (job_id, index) = stealable.swap_remove(i).0;
        let tid = jobs.get_mut(&job_id)?.queues.take_backlog(class, index)?;
        trace!(job = %job_id, task = %tid, worker = %worker.id(), "task taken from backlog");
        Some((job_id, tid))
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    OwnQueue,
    Backlog,
}

fn queueable(graph: &TaskGraph, tid: &TaskId) -> bool {
    graph.task(tid).is_some_and(|task| task.is_queueable())
}

fn runnable_on(graph: &TaskGraph, tid: &TaskId, worker: &Worker) -> bool {
    graph
        .task(tid)
        .is_some_and(|task| task.is_queueable() && worker.supports_handler(&task.handler))
}

fn build_assignment(
    job: &Job,
    tid: &TaskId,
    worker: &WorkerId,
    location: String,
) -> Option<Assignment> {
    let task = job.graph.task(tid)?;
    let inputs = task
        .dependencies
        .iter()
        .filter_map(|(name, id)| task.inputs.get(id).map(|r| (name.clone(), r.clone())))
        .collect();

    Some(Assignment {
        job: job.id.clone(),
        task: tid.clone(),
        worker: worker.clone(),
        location,
        handler: task.handler.clone(),
        inputs,
        expected_outputs: task.expected_outputs.clone(),
        private: task.private.clone(),
        scheduling_class: task.scheduling_class.clone(),
        attempt: task.retry_count + 1,
    })
}
