// src/exec/local.rs

//! In-process execution of assignments.
//!
//! [`LocalBackend`] plays the part of a set of workers living inside the
//! master process: each assignment runs on its own tokio task, input bytes
//! are fetched from an in-memory [`BlockStore`] keyed by worker, and the
//! outcome goes back through a [`MasterHandle`] as a completion report.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{CompletionReport, MasterHandle, TaskOutcome};
use crate::errors::{Result, TaskweaveError};
use crate::recovery::{FailedBinding, FailureReason};
use crate::reference::{RefId, Reference, WorkerId};
use crate::sched::{Assignment, WorkerSpec};
use crate::task::{JobId, TaskDescriptor, TaskId};

use super::backend::{DispatchBackend, ProbeFuture};

/// What a handler sees of its task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job: JobId,
    pub task: TaskId,
    pub worker: WorkerId,
    pub attempt: u32,
    /// Input bytes by local dependency name.
    pub inputs: BTreeMap<String, Vec<u8>>,
    pub private: Option<Vec<u8>>,
    pub expected_outputs: Vec<RefId>,
}

/// What a handler produced.
///
/// Expected outputs missing from `outputs` must be produced by one of the
/// `spawned` children (delegation).
#[derive(Debug, Clone, Default)]
pub struct HandlerOutput {
    pub outputs: BTreeMap<RefId, Vec<u8>>,
    pub spawned: Vec<TaskDescriptor>,
}

impl HandlerOutput {
    /// Publish the same bytes on every expected output.
    pub fn all(ctx: &TaskContext, bytes: Vec<u8>) -> Self {
        Self {
            outputs: ctx
                .expected_outputs
                .iter()
                .map(|id| (id.clone(), bytes.clone()))
                .collect(),
            spawned: Vec::new(),
        }
    }

    pub fn with_output(mut self, id: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.outputs.insert(RefId::new(id), bytes);
        self
    }

    pub fn with_child(mut self, child: TaskDescriptor) -> Self {
        self.spawned.push(child);
        self
    }
}

pub type HandlerFn = Arc<
    dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = anyhow::Result<HandlerOutput>> + Send>>
        + Send
        + Sync,
>;

/// Handler name -> async closure.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `const` and `concat`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("const", |ctx: TaskContext| async move {
            let bytes = ctx.private.clone().unwrap_or_default();
            anyhow::Ok(HandlerOutput::all(&ctx, bytes))
        });
        registry.register("concat", |ctx: TaskContext| async move {
            let bytes = ctx.inputs.values().flatten().copied().collect();
            anyhow::Ok(HandlerOutput::all(&ctx, bytes))
        });
        registry
    }

    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HandlerOutput>> + Send + 'static,
    {
        let handler_fn: HandlerFn = Arc::new(move |ctx: TaskContext| {
            Box::pin(handler(ctx))
                as Pin<Box<dyn Future<Output = anyhow::Result<HandlerOutput>> + Send>>
        });
        self.handlers.insert(name.to_string(), handler_fn);
        debug!(handler = name, "registered task handler");
    }

    pub fn get(&self, name: &str) -> Option<HandlerFn> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Output bytes held by each in-process worker.
#[derive(Debug, Clone, Default)]
pub struct BlockStore {
    blocks: Arc<Mutex<HashMap<WorkerId, HashMap<RefId, Arc<Vec<u8>>>>>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkerId, HashMap<RefId, Arc<Vec<u8>>>>> {
        // Stored blocks are immutable; a poisoned lock still holds valid data.
        self.blocks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put(&self, worker: &WorkerId, id: &RefId, bytes: Vec<u8>) {
        self.lock()
            .entry(worker.clone())
            .or_default()
            .insert(id.clone(), Arc::new(bytes));
    }

    pub fn get(&self, worker: &WorkerId, id: &RefId) -> Option<Arc<Vec<u8>>> {
        self.lock().get(worker).and_then(|b| b.get(id)).cloned()
    }

    pub fn contains(&self, worker: &WorkerId, id: &RefId) -> bool {
        self.lock().get(worker).is_some_and(|b| b.contains_key(id))
    }

    pub fn remove(&self, worker: &WorkerId, id: &RefId) -> bool {
        self.lock()
            .get_mut(worker)
            .is_some_and(|b| b.remove(id).is_some())
    }

    /// Forget everything a worker held.
    pub fn drop_worker(&self, worker: &WorkerId) {
        self.lock().remove(worker);
    }
}

/// Backend executing assignments on tokio tasks inside this process.
pub struct LocalBackend {
    registry: Arc<HandlerRegistry>,
    store: BlockStore,
    master: MasterHandle,
    inline_limit: usize,
    running: HashMap<(JobId, TaskId), JoinHandle<()>>,
}

impl fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBackend")
            .field("registry", &self.registry)
            .field("inline_limit", &self.inline_limit)
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

impl LocalBackend {
    pub fn new(
        registry: HandlerRegistry,
        store: BlockStore,
        master: MasterHandle,
        inline_limit: usize,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            master,
            inline_limit,
            running: HashMap::new(),
        }
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }
}

impl DispatchBackend for LocalBackend {
    fn dispatch(
        &mut self,
        assignments: Vec<Assignment>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.running.retain(|_, handle| !handle.is_finished());

        for assignment in assignments {
            let key = (assignment.job.clone(), assignment.task.clone());
            let registry = Arc::clone(&self.registry);
            let store = self.store.clone();
            let master = self.master.clone();
            let inline_limit = self.inline_limit;

            let handle = tokio::spawn(async move {
                let report = run_assignment(&registry, &store, inline_limit, assignment).await;
                let (job, task) = (report.job.clone(), report.task.clone());
                if let Err(e) = master.report_completion(report).await {
                    warn!(%job, %task, error = %e, "completion report was not accepted");
                }
            });
            self.running.insert(key, handle);
        }

        Box::pin(async { Ok(()) })
    }

    fn abort(
        &mut self,
        worker: WorkerId,
        job: JobId,
        task: TaskId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        if let Some(handle) = self.running.remove(&(job.clone(), task.clone())) {
            debug!(%worker, %job, %task, "aborting local task");
            handle.abort();
        }
        Box::pin(async { Ok(()) })
    }

    fn probe(&self, worker: &WorkerId, _location: &str, reference: &RefId) -> ProbeFuture {
        let present = self.store.contains(worker, reference);
        Box::pin(async move { present })
    }
}

/// Fetch inputs, run the handler and turn its result into a report.
async fn run_assignment(
    registry: &HandlerRegistry,
    store: &BlockStore,
    inline_limit: usize,
    assignment: Assignment,
) -> CompletionReport {
    let outcome = execute(registry, store, inline_limit, &assignment).await;
    CompletionReport {
        job: assignment.job,
        task: assignment.task,
        worker: assignment.worker,
        outcome,
    }
}

async fn execute(
    registry: &HandlerRegistry,
    store: &BlockStore,
    inline_limit: usize,
    assignment: &Assignment,
) -> TaskOutcome {
    let Some(handler) = registry.get(&assignment.handler) else {
        return failed(
            FailureReason::RuntimeException,
            format!("no handler named '{}'", assignment.handler),
        );
    };

    let mut inputs = BTreeMap::new();
    let mut missing = Vec::new();
    for (name, reference) in &assignment.inputs {
        match fetch(store, reference) {
            Ok(bytes) => {
                inputs.insert(name.clone(), bytes);
            }
            Err(binding) => missing.push(binding),
        }
    }
    let private = match assignment.private.as_ref().map(|r| fetch(store, r)) {
        None => None,
        Some(Ok(bytes)) => Some(bytes),
        Some(Err(binding)) => {
            missing.push(binding);
            None
        }
    };

    if !missing.is_empty() {
        return TaskOutcome::Failed {
            reason: FailureReason::MissingInput,
            detail: Some(format!("{} input(s) could not be fetched", missing.len())),
            failed_bindings: missing,
        };
    }

    let ctx = TaskContext {
        job: assignment.job.clone(),
        task: assignment.task.clone(),
        worker: assignment.worker.clone(),
        attempt: assignment.attempt,
        inputs,
        private,
        expected_outputs: assignment.expected_outputs.clone(),
    };

    debug!(
        job = %assignment.job,
        task = %assignment.task,
        worker = %assignment.worker,
        handler = %assignment.handler,
        attempt = assignment.attempt,
        "running task"
    );

    match handler(ctx).await {
        Ok(output) => {
            let published = output
                .outputs
                .into_iter()
                .map(|(id, bytes)| store_output(store, &assignment.worker, inline_limit, id, bytes))
                .collect();
            TaskOutcome::Committed {
                spawned: output.spawned,
                published,
            }
        }
        Err(e) => failed(FailureReason::RuntimeException, format!("{e:#}")),
    }
}

fn failed(reason: FailureReason, detail: String) -> TaskOutcome {
    TaskOutcome::Failed {
        reason,
        detail: Some(detail),
        failed_bindings: Vec::new(),
    }
}

/// Bytes of a bound value, or the binding to report as missing.
fn fetch(store: &BlockStore, reference: &Reference) -> std::result::Result<Vec<u8>, FailedBinding> {
    match reference {
        Reference::DataValue { value, .. } => Ok(value.clone()),
        Reference::Completed { .. } => Ok(Vec::new()),
        other => {
            let locations = other.locations();
            locations
                .iter()
                .find_map(|w| store.get(w, other.id()))
                .map(|bytes| bytes.as_ref().clone())
                .ok_or_else(|| FailedBinding {
                    reference: other.id().clone(),
                    locations,
                })
        }
    }
}

fn store_output(
    store: &BlockStore,
    worker: &WorkerId,
    inline_limit: usize,
    id: RefId,
    bytes: Vec<u8>,
) -> Reference {
    if bytes.len() <= inline_limit {
        return Reference::DataValue { id, value: bytes };
    }
    let size = bytes.len() as u64;
    store.put(worker, &id, bytes);
    Reference::Concrete {
        id,
        size_hint: Some(size),
        hints: BTreeSet::from([worker.clone()]),
    }
}

/// Register the given workers and keep them alive with periodic heartbeats.
///
/// A worker the master has declared dead is registered again on its next
/// beat.
pub fn spawn_heartbeats(
    master: MasterHandle,
    workers: Vec<WorkerSpec>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for spec in &workers {
            if let Err(e) = master.register_worker(spec.clone()).await {
                warn!(worker = %spec.id, error = %e, "failed to register local worker");
                return;
            }
            info!(worker = %spec.id, location = %spec.location, "local worker registered");
        }

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for spec in &workers {
                match master.heartbeat(spec.id.clone()).await {
                    Ok(()) => {}
                    Err(TaskweaveError::UnknownWorker(_)) => {
                        warn!(worker = %spec.id, "master forgot local worker; registering again");
                        if master.register_worker(spec.clone()).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        debug!("master stopped; heartbeats end");
                        return;
                    }
                }
            }
        }
    })
}
