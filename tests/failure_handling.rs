// tests/failure_handling.rs

use std::error::Error;
use std::time::Duration;

use taskweave::engine::{CoreCommand, CoreMaster, CoreStep, MasterSettings};
use taskweave::errors::TaskweaveError;
use taskweave::recovery::FailureReason;
use taskweave::reference::{LOST_FIXED_OBJECT, RefId, Reference, WorkerId};
use taskweave::sched::Assignment;
use taskweave::task::{JobId, JobState, TaskDescriptor, TaskId, TaskState};
use taskweave_test_utils::builders::{
    committed, failed, fixed, spawned_and_committed, task, worker,
};
use taskweave_test_utils::{init_tracing, seeded_core};

type TestResult = Result<(), Box<dyn Error>>;

fn state(core: &CoreMaster, job: &JobId, tid: &str) -> TaskState {
    core.task_status(job, &TaskId::new(tid))
        .map(|s| s.state)
        .unwrap_or_else(|e| panic!("task {tid}: {e}"))
}

fn single(step: &CoreStep) -> Assignment {
    let assignments = step.assignments();
    assert_eq!(assignments.len(), 1, "got {assignments:?}");
    assignments[0].clone()
}

fn error_reason(core: &CoreMaster, job: &JobId, id: &str) -> Option<String> {
    match core.job(job)?.graph.reference(&RefId::new(id))? {
        Reference::Error { reason, .. } => Some(reason.clone()),
        _ => None,
    }
}

/// Root `R` spawning `A -> a` and `B(a) -> out`; returns once both are in
/// the graph and `A` is dispatched.
fn two_step_job(core: &mut CoreMaster) -> Result<(JobId, Assignment), Box<dyn Error>> {
    let (job, _) = core.submit_job(task("R").output("out").build(), None)?;
    let r = single(&core.schedule());
    let children = vec![
        task("A").output("a").build(),
        task("B").after("a").output("out").build(),
    ];
    core.report_completion(spawned_and_committed(&job, "R", &r.worker.0, children, vec![]))?;
    let a = single(&core.schedule());
    assert_eq!(a.task, TaskId::new("A"));
    Ok((job, a))
}

#[test]
fn runtime_exception_is_never_retried() -> TestResult {
    init_tracing();
    let (mut core, _clock) = seeded_core(MasterSettings::default());
    core.register_worker(worker("w1"));

    let (job, _) = core.submit_job(task("T").output("t").build(), None)?;
    single(&core.schedule());
    core.report_completion(failed(&job, "T", "w1", FailureReason::RuntimeException))?;

    assert_eq!(state(&core, &job, "T"), TaskState::Failed);
    assert!(core.schedule().assignments().is_empty());
    assert_eq!(core.job_status(&job)?.state, JobState::Failed);
    assert_eq!(
        error_reason(&core, &job, "t").as_deref(),
        Some("RUNTIME_EXCEPTION")
    );
    Ok(())
}

#[test]
fn failed_input_cascades_with_the_original_reason() -> TestResult {
    init_tracing();
    let (mut core, _clock) = seeded_core(MasterSettings::default());
    core.register_worker(worker("w1"));

    let (job, a) = two_step_job(&mut core)?;
    assert_eq!(state(&core, &job, "B"), TaskState::Blocking);

    let mut report = failed(&job, "A", &a.worker.0, FailureReason::RuntimeException);
    if let taskweave::engine::TaskOutcome::Failed { detail, .. } = &mut report.outcome {
        *detail = Some("division by zero".to_string());
    }
    core.report_completion(report)?;

    assert_eq!(state(&core, &job, "B"), TaskState::Failed);
    let b = core.task_status(&job, &TaskId::new("B"))?;
    let (reason, _) = b.failure.ok_or("B has no failure")?;
    assert_eq!(reason, "DEPENDENCY_FAILED");

    match core.job_result(&job)? {
        Some(Reference::Error { reason, detail, .. }) => {
            assert_eq!(reason, "RUNTIME_EXCEPTION");
            assert_eq!(detail.as_deref(), Some("division by zero"));
        }
        other => panic!("expected an error result, got {other:?}"),
    }
    assert_eq!(core.job_status(&job)?.state, JobState::Failed);
    Ok(())
}

#[test]
fn task_depending_on_a_known_error_fails_without_running() -> TestResult {
    init_tracing();
    let (mut core, _clock) = seeded_core(MasterSettings::default());
    core.register_worker(worker("w1"));

    let broken = Reference::error(RefId::new("in"), "UPSTREAM_GONE", None);
    let (job, _) = core.submit_job(task("T").dep("in", broken).output("t").build(), None)?;

    assert_eq!(state(&core, &job, "T"), TaskState::Failed);
    assert!(core.schedule().assignments().is_empty());
    assert_eq!(error_reason(&core, &job, "t").as_deref(), Some("UPSTREAM_GONE"));
    Ok(())
}

#[test]
fn aborting_an_assigned_task_stops_it_and_fails_consumers() -> TestResult {
    init_tracing();
    let (mut core, _clock) = seeded_core(MasterSettings::default());
    core.register_worker(worker("w1"));

    let (job, a) = two_step_job(&mut core)?;
    let step = core.abort_task(&job, &TaskId::new("A"))?;

    let stops: Vec<_> = step
        .commands
        .iter()
        .filter_map(|c| match c {
            CoreCommand::AbortOnWorker { worker, task, .. } => Some((worker.clone(), task.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(stops, vec![(a.worker.clone(), TaskId::new("A"))]);

    assert_eq!(state(&core, &job, "A"), TaskState::Aborted);
    assert_eq!(state(&core, &job, "B"), TaskState::Failed);
    assert_eq!(error_reason(&core, &job, "a").as_deref(), Some("ABORTED"));
    assert_eq!(core.job_status(&job)?.state, JobState::Aborted);

    // The worker's late answer changes nothing.
    let late = committed(&job, "A", &a.worker.0, vec![Reference::concrete("a", Some(1), ["w1"])]);
    let step = core.report_completion(late)?;
    assert!(step.assignments().is_empty());
    assert_eq!(state(&core, &job, "A"), TaskState::Aborted);
    assert_eq!(error_reason(&core, &job, "a").as_deref(), Some("ABORTED"));
    Ok(())
}

#[test]
fn aborting_a_job_cancels_every_live_task() -> TestResult {
    init_tracing();
    let (mut core, _clock) = seeded_core(MasterSettings::default());
    core.register_worker(worker("w1"));

    let (job, _) = two_step_job(&mut core)?;
    let step = core.abort_job(&job)?;

    let finished = step
        .commands
        .iter()
        .filter(|c| matches!(c, CoreCommand::JobFinished { .. }))
        .count();
    assert_eq!(finished, 1);
    assert_eq!(core.job_status(&job)?.state, JobState::Aborted);
    assert_eq!(state(&core, &job, "R"), TaskState::Committed);
    assert_eq!(state(&core, &job, "A"), TaskState::Aborted);
    assert!(matches!(
        state(&core, &job, "B"),
        TaskState::Aborted | TaskState::Failed
    ));

    // Aborting again is harmless.
    let again = core.abort_job(&job)?;
    assert!(again.assignments().is_empty());
    Ok(())
}

#[test]
fn fixed_input_pins_the_task_to_its_worker() -> TestResult {
    init_tracing();
    for seed in 0..8u64 {
        let settings = MasterSettings {
            rng_seed: Some(seed),
            ..MasterSettings::default()
        };
        let (mut core, _clock) = seeded_core(settings);
        for w in ["w1", "w2", "w3"] {
            core.register_worker(worker(w));
        }
        let (_job, _) =
            core.submit_job(task("T").dep("f", fixed("F", "w2")).output("t").build(), None)?;
        let a = single(&core.schedule());
        assert_eq!(a.worker, WorkerId::new("w2"), "seed {seed}");
    }
    Ok(())
}

#[test]
fn fixed_input_on_a_missing_worker_is_lost() -> TestResult {
    init_tracing();
    let (mut core, _clock) = seeded_core(MasterSettings::default());
    core.register_worker(worker("w1"));

    let (job, _) =
        core.submit_job(task("T").dep("f", fixed("F", "nowhere")).output("t").build(), None)?;
    let step = core.schedule();

    assert!(step.assignments().is_empty());
    assert_eq!(state(&core, &job, "T"), TaskState::Failed);
    assert_eq!(error_reason(&core, &job, "F").as_deref(), Some(LOST_FIXED_OBJECT));
    assert_eq!(error_reason(&core, &job, "t").as_deref(), Some(LOST_FIXED_OBJECT));
    assert_eq!(core.job_status(&job)?.state, JobState::Failed);
    Ok(())
}

#[test]
fn fixed_input_on_a_worker_without_the_handler_fails_the_task() -> TestResult {
    init_tracing();
    let (mut core, _clock) = seeded_core(MasterSettings::default());
    core.register_worker(worker("w1").with_handlers(["python"]));

    let (job, _) =
        core.submit_job(task("T").dep("f", fixed("F", "w1")).output("t").build(), None)?;
    for _ in 0..3 {
        assert!(core.schedule().assignments().is_empty());
    }

    assert_eq!(state(&core, &job, "T"), TaskState::Failed);
    let t = core.task_status(&job, &TaskId::new("T"))?;
    assert_eq!(t.failure.map(|f| f.0).as_deref(), Some(LOST_FIXED_OBJECT));
    assert_eq!(error_reason(&core, &job, "t").as_deref(), Some(LOST_FIXED_OBJECT));
    // The object itself is still where it was.
    assert!(matches!(
        core.job(&job).and_then(|j| j.graph.reference(&RefId::new("F"))),
        Some(Reference::Fixed { .. })
    ));
    assert_eq!(core.job_status(&job)?.state, JobState::Failed);
    Ok(())
}

#[test]
fn deregistering_the_fixed_location_fails_pinned_tasks() -> TestResult {
    init_tracing();
    let (mut core, _clock) = seeded_core(MasterSettings::default());
    core.register_worker(worker("w1"));
    core.register_worker(worker("w2"));

    let (job, _) =
        core.submit_job(task("T").dep("f", fixed("F", "w2")).output("t").build(), None)?;
    assert_eq!(state(&core, &job, "T"), TaskState::Runnable);

    core.deregister_worker(&WorkerId::new("w2"))?;

    assert_eq!(state(&core, &job, "T"), TaskState::Failed);
    let t = core.task_status(&job, &TaskId::new("T"))?;
    assert_eq!(t.failure.map(|f| f.0).as_deref(), Some(LOST_FIXED_OBJECT));
    assert!(core.schedule().assignments().is_empty());
    Ok(())
}

#[test]
fn expired_heartbeat_moves_work_to_a_live_worker() -> TestResult {
    init_tracing();
    let settings = MasterSettings {
        heartbeat_timeout: Duration::from_secs(30),
        ..MasterSettings::default()
    };
    let (mut core, clock) = seeded_core(settings);
    core.register_worker(worker("w1"));
    core.register_worker(worker("w2"));

    let (job, _) = core.submit_job(task("T").output("t").build(), None)?;
    let first = single(&core.schedule());
    let survivor = if first.worker == WorkerId::new("w1") { "w2" } else { "w1" };

    clock.advance(Duration::from_secs(31));
    core.heartbeat(&WorkerId::new(survivor))?;
    let step = core.check_heartbeats();
    assert!(step.wants_schedule());

    assert!(!core.pool().contains(&first.worker));
    assert_eq!(state(&core, &job, "T"), TaskState::Runnable);

    let second = single(&core.schedule());
    assert_eq!(second.worker, WorkerId::new(survivor));
    assert_eq!(second.attempt, 2);

    // The dead worker's answer arrives too late to count.
    core.report_completion(committed(&job, "T", &first.worker.0, vec![]))?;
    assert_eq!(state(&core, &job, "T"), TaskState::Assigned);
    Ok(())
}

#[test]
fn report_from_the_wrong_worker_is_ignored() -> TestResult {
    init_tracing();
    let (mut core, _clock) = seeded_core(MasterSettings::default());
    core.register_worker(worker("w1"));

    let (job, _) = core.submit_job(task("T").output("t").build(), None)?;
    single(&core.schedule());

    let step = core.report_completion(committed(
        &job,
        "T",
        "impostor",
        vec![Reference::concrete("t", Some(1), ["impostor"])],
    ))?;
    assert!(step.is_empty());
    assert_eq!(state(&core, &job, "T"), TaskState::Assigned);
    assert_eq!(core.job_result(&job)?, None);
    Ok(())
}

#[test]
fn invalid_spawn_rejects_the_whole_batch() -> TestResult {
    init_tracing();
    let (mut core, _clock) = seeded_core(MasterSettings::default());
    core.register_worker(worker("w1"));

    let (job, _) = core.submit_job(task("R").output("out").build(), None)?;
    single(&core.schedule());

    let good = task("ok").output("out").build();
    let bad = TaskDescriptor {
        handler: String::new(),
        ..task("bad").output("x").build()
    };
    core.report_completion(spawned_and_committed(&job, "R", "w1", vec![good, bad], vec![]))?;

    assert_eq!(state(&core, &job, "R"), TaskState::Failed);
    assert!(core.task_status(&job, &TaskId::new("ok")).is_err());
    assert_eq!(core.job_status(&job)?.state, JobState::Failed);
    Ok(())
}

#[test]
fn unknown_ids_are_consistency_errors() -> TestResult {
    init_tracing();
    let (mut core, _clock) = seeded_core(MasterSettings::default());

    let ghost = JobId::new("ghost");
    let err = core
        .report_completion(committed(&ghost, "T", "w1", vec![]))
        .unwrap_err();
    assert!(matches!(err, TaskweaveError::UnknownJob(_)));
    assert!(err.is_consistency_error());

    let err = core.heartbeat(&WorkerId::new("w9")).unwrap_err();
    assert!(matches!(err, TaskweaveError::UnknownWorker(_)));

    let (job, _) = core.submit_job(task("T").output("t").build(), None)?;
    let err = core.abort_task(&job, &TaskId::new("nope")).unwrap_err();
    assert!(err.is_consistency_error());
    Ok(())
}

#[test]
fn finished_jobs_can_be_discarded() -> TestResult {
    init_tracing();
    let (mut core, _clock) = seeded_core(MasterSettings::default());
    core.register_worker(worker("w1"));

    let (job, _) = core.submit_job(task("T").output("t").build(), None)?;
    single(&core.schedule());
    let err = core.discard_job(&job).unwrap_err();
    assert!(!err.is_consistency_error(), "running jobs cannot be discarded");

    let done = Reference::Completed { id: RefId::new("t") };
    core.report_completion(committed(&job, "T", "w1", vec![done]))?;
    assert_eq!(core.job_status(&job)?.state, JobState::Committed);

    core.discard_job(&job)?;
    assert!(matches!(
        core.job_status(&job),
        Err(TaskweaveError::UnknownJob(_))
    ));
    Ok(())
}
