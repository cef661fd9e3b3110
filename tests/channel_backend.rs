// tests/channel_backend.rs
//
// The runtime over a `ChannelBackend`; the test owns the receiving end and
// plays the transport.

use std::error::Error;
use std::time::Duration;

use taskweave::engine::{MasterEvent, MasterHandle, MasterSettings, Runtime};
use taskweave::exec::{BackendRequest, ChannelBackend};
use taskweave::reference::{RefId, Reference, WorkerId};
use taskweave::sched::{Assignment, WorkerSpec};
use taskweave::task::{JobState, TaskId, TaskState};
use taskweave_test_utils::builders::{missing_input, task, worker};
use taskweave_test_utils::{init_tracing, seeded_core, with_timeout};
use tokio::sync::mpsc;

type TestResult = Result<(), Box<dyn Error>>;

fn start() -> (MasterHandle, mpsc::Receiver<BackendRequest>) {
    let (core, _clock) = seeded_core(MasterSettings::default());
    let (tx, rx) = mpsc::channel::<MasterEvent>(64);
    let handle = MasterHandle::new(tx.clone());
    let (backend, requests) = ChannelBackend::new(16);
    let runtime = Runtime::new(core, rx, &tx, backend);
    drop(tx);
    tokio::spawn(runtime.run());
    (handle, requests)
}

async fn next(requests: &mut mpsc::Receiver<BackendRequest>) -> Result<BackendRequest, Box<dyn Error>> {
    let request = with_timeout(requests.recv())
        .await
        .ok_or("backend channel closed")?;
    Ok(request)
}

async fn next_dispatch(
    requests: &mut mpsc::Receiver<BackendRequest>,
) -> Result<Assignment, Box<dyn Error>> {
    match next(requests).await? {
        BackendRequest::Dispatch(a) => Ok(a),
        other => Err(format!("expected a dispatch, got {other:?}").into()),
    }
}

#[tokio::test]
async fn transport_sees_dispatch_location_check_and_abort() -> TestResult {
    init_tracing();
    let (handle, mut requests) = start();

    handle
        .register_worker(WorkerSpec::new("w1", "10.0.0.1:9001"))
        .await?;
    let z = Reference::concrete("Z", Some(10), ["w1"]);
    let job = handle
        .submit_job(task("E").dep("z", z.clone()).output("e").build(), None)
        .await?;

    let first = next_dispatch(&mut requests).await?;
    assert_eq!(first.task, TaskId::new("E"));
    assert_eq!(first.location, "10.0.0.1:9001");
    assert_eq!(first.inputs.get("z"), Some(&z));

    handle
        .report_completion(missing_input(&job, "E", "w1", "Z", &["w1"]))
        .await?;

    match next(&mut requests).await? {
        BackendRequest::Probe {
            worker,
            location,
            reference,
            reply,
        } => {
            assert_eq!(worker, WorkerId::new("w1"));
            assert_eq!(location, "10.0.0.1:9001");
            assert_eq!(reference, RefId::new("Z"));
            reply.send(true).map_err(|_| "probe reply dropped")?;
        }
        other => return Err(format!("expected a probe, got {other:?}").into()),
    }

    let second = next_dispatch(&mut requests).await?;
    assert_eq!(second.task, TaskId::new("E"));
    assert_eq!(second.attempt, first.attempt);

    handle.abort_job(job.clone()).await?;
    match next(&mut requests).await? {
        BackendRequest::Abort { worker, job: j, task: t } => {
            assert_eq!(worker, WorkerId::new("w1"));
            assert_eq!(j, job);
            assert_eq!(t, TaskId::new("E"));
        }
        other => return Err(format!("expected an abort, got {other:?}").into()),
    }

    let status = handle.job_status(job.clone()).await?;
    assert_eq!(status.state, JobState::Aborted);
    let result = handle.wait_result(job, Duration::from_secs(1)).await?;
    assert!(matches!(result, Some(Reference::Error { ref reason, .. }) if reason == "ABORTED"));

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn unanswered_location_check_fails_a_job_whose_input_has_no_producer() -> TestResult {
    init_tracing();
    let (handle, mut requests) = start();

    handle.register_worker(worker("w1")).await?;
    let job = handle
        .submit_job(
            task("E")
                .dep("z", Reference::concrete("Z", Some(10), ["w1"]))
                .output("e")
                .build(),
            None,
        )
        .await?;
    next_dispatch(&mut requests).await?;

    handle
        .report_completion(missing_input(&job, "E", "w1", "Z", &["w1"]))
        .await?;
    match next(&mut requests).await? {
        BackendRequest::Probe { reply, .. } => drop(reply),
        other => return Err(format!("expected a probe, got {other:?}").into()),
    }

    // Z has no copy left and nothing can produce it again.
    let result = handle.wait_result(job.clone(), Duration::from_secs(1)).await?;
    assert!(matches!(result, Some(Reference::Error { ref reason, .. }) if reason == "MISSING_INPUT"));
    assert_eq!(handle.job_status(job.clone()).await?.state, JobState::Failed);
    let e = handle.task_status(job, TaskId::new("E")).await?;
    assert_eq!(e.state, TaskState::Failed);
    assert!(requests.try_recv().is_err(), "E must not be dispatched again");

    handle.shutdown().await?;
    Ok(())
}
