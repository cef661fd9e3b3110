use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use taskweave::errors::Result;
use taskweave::exec::{DispatchBackend, ProbeFuture};
use taskweave::reference::{RefId, WorkerId};
use taskweave::sched::Assignment;
use taskweave::task::{JobId, TaskId};
use tokio::sync::mpsc;

/// Everything the runtime asked the backend to do, in order.
#[derive(Debug, Default)]
pub struct BackendLog {
    pub dispatched: Vec<Assignment>,
    pub aborted: Vec<(WorkerId, JobId, TaskId)>,
    pub probed: Vec<(WorkerId, RefId)>,
}

/// A fake backend that:
/// - records dispatches, aborts and probes
/// - forwards each assignment on a channel so the test can answer it
/// - answers probes from a fixed set of `(worker, reference)` pairs.
pub struct FakeBackend {
    log: Arc<Mutex<BackendLog>>,
    assignments: mpsc::UnboundedSender<Assignment>,
    holdings: Arc<Mutex<HashSet<(WorkerId, RefId)>>>,
}

impl FakeBackend {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Assignment>, Arc<Mutex<BackendLog>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(BackendLog::default()));
        let backend = Self {
            log: Arc::clone(&log),
            assignments: tx,
            holdings: Arc::new(Mutex::new(HashSet::new())),
        };
        (backend, rx, log)
    }

    /// Pretend `worker` still holds `reference` when probed.
    pub fn holds(self, worker: &str, reference: &str) -> Self {
        self.holdings
            .lock()
            .unwrap()
            .insert((WorkerId::new(worker), RefId::new(reference)));
        self
    }
}

impl DispatchBackend for FakeBackend {
    fn dispatch(
        &mut self,
        assignments: Vec<Assignment>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let log = Arc::clone(&self.log);
        let tx = self.assignments.clone();

        Box::pin(async move {
            for a in assignments {
                log.lock().unwrap().dispatched.push(a.clone());
                let _ = tx.send(a);
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
        self.log.lock().unwrap().aborted.push((worker, job, task));
        Box::pin(async { Ok(()) })
    }

    fn probe(&self, worker: &WorkerId, _location: &str, reference: &RefId) -> ProbeFuture {
        self.log
            .lock()
            .unwrap()
            .probed
            .push((worker.clone(), reference.clone()));
        let present = self
            .holdings
            .lock()
            .unwrap()
            .contains(&(worker.clone(), reference.clone()));
        Box::pin(async move { present })
    }
}
