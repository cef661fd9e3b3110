// tests/local_execution.rs
//
// The whole stack in one process: runtime, local backend, real handlers.

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use taskweave::engine::{MasterEvent, MasterHandle, MasterSettings, Runtime};
use taskweave::exec::{BlockStore, HandlerOutput, HandlerRegistry, LocalBackend, TaskContext};
use taskweave::reference::{RefId, Reference, WorkerId};
use taskweave::task::{JobState, TaskId, TaskState};
use taskweave_test_utils::builders::{TaskBuilder, task, value, worker};
use taskweave_test_utils::{init_tracing, seeded_core, with_timeout};
use tokio::sync::mpsc;

type TestResult = Result<(), Box<dyn Error>>;

/// Spawns `const` leaves for "hello " and "world" and delegates its own
/// output to a `concat` child.
fn fan_out(ctx: TaskContext) -> HandlerOutput {
    let out = ctx.expected_outputs[0].as_str().to_string();
    HandlerOutput::default()
        .with_child(
            TaskBuilder::new("hello", "const")
                .private(b"hello ")
                .output("h")
                .build(),
        )
        .with_child(
            TaskBuilder::new("world", "const")
                .private(b"world")
                .output("w")
                .build(),
        )
        .with_child(
            TaskBuilder::new("join", "concat")
                .dep("1", Reference::future("h"))
                .dep("2", Reference::future("w"))
                .output(&out)
                .build(),
        )
}

fn start(registry: HandlerRegistry, inline_limit: usize) -> (MasterHandle, BlockStore) {
    start_with_store(registry, BlockStore::new(), inline_limit)
}

fn start_with_store(
    registry: HandlerRegistry,
    store: BlockStore,
    inline_limit: usize,
) -> (MasterHandle, BlockStore) {
    let (core, _clock) = seeded_core(MasterSettings::default());
    let (tx, rx) = mpsc::channel::<MasterEvent>(64);
    let handle = MasterHandle::new(tx.clone());
    let backend = LocalBackend::new(registry, store.clone(), handle.clone(), inline_limit);
    let runtime = Runtime::new(core, rx, &tx, backend);
    drop(tx);
    tokio::spawn(runtime.run());
    (handle, store)
}

#[tokio::test]
async fn spawned_graph_produces_the_delegated_result() -> TestResult {
    init_tracing();
    let mut registry = HandlerRegistry::with_builtins();
    registry.register("fan_out", |ctx: TaskContext| async move { anyhow::Ok(fan_out(ctx)) });
    let (handle, _store) = start(registry, 1024);

    handle.register_worker(worker("w1")).await?;
    handle.register_worker(worker("w2")).await?;
    let job = handle
        .submit_job(TaskBuilder::new("root", "fan_out").output("greeting").build(), None)
        .await?;

    let result = with_timeout(handle.wait_result(job.clone(), Duration::from_secs(5)))
        .await?
        .ok_or("job did not finish")?;
    assert_eq!(result, value("greeting", b"hello world"));

    let status = handle.job_status(job.clone()).await?;
    assert_eq!(status.state, JobState::Committed);
    let root = handle.task_status(job, TaskId::new("root")).await?;
    assert_eq!(root.state, TaskState::Committed);
    assert_eq!(root.children.len(), 3);

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn large_outputs_travel_by_reference() -> TestResult {
    init_tracing();
    let (handle, store) = start(HandlerRegistry::with_builtins(), 4);

    handle.register_worker(worker("w1")).await?;
    let job = handle
        .submit_job(
            TaskBuilder::new("big", "const")
                .private(b"0123456789")
                .output("blob")
                .build(),
            None,
        )
        .await?;

    let result = with_timeout(handle.wait_result(job, Duration::from_secs(5)))
        .await?
        .ok_or("job did not finish")?;
    assert_eq!(result, Reference::concrete("blob", Some(10), ["w1"]));

    let bytes = store
        .get(&WorkerId::new("w1"), &RefId::new("blob"))
        .ok_or("blob not stored on w1")?;
    assert_eq!(bytes.as_slice(), b"0123456789");

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn handler_errors_fail_the_job() -> TestResult {
    init_tracing();
    let (handle, _store) = start(HandlerRegistry::with_builtins(), 1024);

    handle.register_worker(worker("w1")).await?;
    let job = handle
        .submit_job(task("T").output("t").build(), None)
        .await?;

    // No "noop" handler is registered.
    let result = with_timeout(handle.wait_result(job.clone(), Duration::from_secs(5)))
        .await?
        .ok_or("job did not finish")?;
    match result {
        Reference::Error { reason, detail, .. } => {
            assert_eq!(reason, "RUNTIME_EXCEPTION");
            assert!(detail.unwrap_or_default().contains("noop"));
        }
        other => panic!("expected an error, got {other}"),
    }
    assert_eq!(handle.job_status(job).await?.state, JobState::Failed);

    handle.shutdown().await?;
    Ok(())
}

/// `produce -> blob`, `evict(blob) -> g` and `concat(blob, g) -> out`.
///
/// `evict` deletes the blob from its worker after reading it, so the concat
/// finds it gone.
fn pipeline(ctx: TaskContext) -> HandlerOutput {
    let out = ctx.expected_outputs[0].as_str().to_string();
    HandlerOutput::default()
        .with_child(TaskBuilder::new("produce", "produce").output("blob").build())
        .with_child(
            TaskBuilder::new("evict", "evict")
                .dep("blob", Reference::future("blob"))
                .output("g")
                .build(),
        )
        .with_child(
            TaskBuilder::new("join", "concat")
                .dep("1", Reference::future("blob"))
                .dep("2", Reference::future("g"))
                .output(&out)
                .build(),
        )
}

#[tokio::test]
async fn evicted_intermediate_is_recomputed() -> TestResult {
    init_tracing();
    let store = BlockStore::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::with_builtins();
    registry.register("pipeline", |ctx: TaskContext| async move { anyhow::Ok(pipeline(ctx)) });
    let produced = Arc::clone(&runs);
    registry.register("produce", move |_ctx: TaskContext| {
        produced.fetch_add(1, Ordering::SeqCst);
        async move { anyhow::Ok(HandlerOutput::default().with_output("blob", b"0123456789".to_vec())) }
    });
    let evicting = store.clone();
    registry.register("evict", move |ctx: TaskContext| {
        let store = evicting.clone();
        async move {
            anyhow::ensure!(
                store.remove(&ctx.worker, &RefId::new("blob")),
                "blob was not on {}",
                ctx.worker
            );
            anyhow::Ok(HandlerOutput::all(&ctx, b"!".to_vec()))
        }
    });
    let (handle, store) = start_with_store(registry, store, 4);

    handle.register_worker(worker("w1")).await?;
    let job = handle
        .submit_job(TaskBuilder::new("root", "pipeline").output("out").build(), None)
        .await?;

    let result = with_timeout(handle.wait_result(job.clone(), Duration::from_secs(5)))
        .await?
        .ok_or("job did not finish")?;
    assert_eq!(result, Reference::concrete("out", Some(11), ["w1"]));
    let bytes = store
        .get(&WorkerId::new("w1"), &RefId::new("out"))
        .ok_or("result not stored on w1")?;
    assert_eq!(bytes.as_slice(), b"0123456789!");
    assert_eq!(runs.load(Ordering::SeqCst), 2, "blob is produced again after eviction");
    assert_eq!(handle.job_status(job).await?.state, JobState::Committed);

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn input_lost_with_its_worker_fails_a_later_job() -> TestResult {
    init_tracing();
    let (handle, store) = start(HandlerRegistry::with_builtins(), 4);
    handle.register_worker(worker("w1")).await?;

    let first = handle
        .submit_job(
            TaskBuilder::new("big", "const")
                .private(b"0123456789")
                .output("blob")
                .build(),
            None,
        )
        .await?;
    let blob = with_timeout(handle.wait_result(first, Duration::from_secs(5)))
        .await?
        .ok_or("first job did not finish")?;
    assert!(store.contains(&WorkerId::new("w1"), &RefId::new("blob")));

    // w1 loses its disk; the master still lists it as the only copy.
    store.drop_worker(&WorkerId::new("w1"));

    let second = handle
        .submit_job(
            TaskBuilder::new("reader", "concat")
                .dep("in", blob)
                .output("copy")
                .build(),
            None,
        )
        .await?;
    let result = with_timeout(handle.wait_result(second.clone(), Duration::from_secs(5)))
        .await?
        .ok_or("second job did not finish")?;
    assert!(matches!(result, Reference::Error { ref reason, .. } if reason == "MISSING_INPUT"));
    assert_eq!(handle.job_status(second).await?.state, JobState::Failed);

    handle.shutdown().await?;
    Ok(())
}
