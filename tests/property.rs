// tests/property.rs

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;
use taskweave::engine::MasterSettings;
use taskweave::recovery::FailureReason;
use taskweave::reference::{RefId, Reference, WorkerId, combine};
use taskweave::sched::Assignment;
use taskweave::task::{JobState, TaskDescriptor, TaskId, TaskState};
use taskweave_test_utils::builders::{
    committed, failed, spawned_and_committed, task, worker, worker_with_slots,
};
use taskweave_test_utils::seeded_core;

fn workers() -> impl Strategy<Value = BTreeSet<WorkerId>> {
    proptest::collection::btree_set(
        prop_oneof![Just("w1"), Just("w2"), Just("w3")].prop_map(WorkerId::new),
        0..3,
    )
}

fn nonempty_workers() -> impl Strategy<Value = BTreeSet<WorkerId>> {
    proptest::collection::btree_set(
        prop_oneof![Just("w1"), Just("w2"), Just("w3")].prop_map(WorkerId::new),
        1..3,
    )
}

// Every observation of the reference "x".
fn reference() -> impl Strategy<Value = Reference> {
    let id = || RefId::new("x");
    prop_oneof![
        Just(Reference::Future { id: id() }),
        workers().prop_map(move |hints| Reference::Stream { id: id(), hints }),
        (prop_oneof![Just(None), (1u64..1000).prop_map(Some)], nonempty_workers()).prop_map(
            move |(size_hint, hints)| Reference::Concrete {
                id: id(),
                size_hint,
                hints,
            }
        ),
        (nonempty_workers(), workers()).prop_map(move |(preferred, hints)| {
            let preferred = preferred.into_iter().next().unwrap_or_else(|| WorkerId::new("w1"));
            Reference::Sweetheart {
                id: id(),
                preferred,
                size_hint: Some(100),
                hints,
            }
        }),
        Just(Reference::Fixed {
            id: id(),
            location: WorkerId::new("w1"),
        }),
        nonempty_workers().prop_map(move |dead| Reference::Tombstone { id: id(), dead }),
        Just(Reference::Completed { id: id() }),
        Just(Reference::Error {
            id: id(),
            reason: "RUNTIME_EXCEPTION".to_string(),
            detail: None,
        }),
        proptest::collection::vec(any::<u8>(), 0..8)
            .prop_map(move |value| Reference::DataValue { id: id(), value }),
    ]
}

/// Random DAG: task `i` depends on a few outputs of tasks `< i`.
fn dag(max_tasks: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=max_tasks)
        .prop_flat_map(|n| {
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n)
        })
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, picks)| {
                    let mut deps: Vec<usize> = if i == 0 {
                        Vec::new()
                    } else {
                        picks.into_iter().map(|p| p % i).collect()
                    };
                    deps.sort_unstable();
                    deps.dedup();
                    deps
                })
                .collect()
        })
}

fn output_of(i: usize, n: usize) -> String {
    if i + 1 == n {
        "out".to_string()
    } else {
        format!("o{i}")
    }
}

/// Tasks the final task transitively depends on, itself included.
fn needed(deps: &[Vec<usize>]) -> BTreeSet<usize> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![deps.len() - 1];
    while let Some(i) = stack.pop() {
        if seen.insert(i) {
            stack.extend(deps[i].iter().copied());
        }
    }
    seen
}

proptest! {
    #[test]
    fn combine_is_idempotent(x in reference()) {
        prop_assert_eq!(combine(&x, &x), x);
    }

    #[test]
    fn future_update_changes_nothing(x in reference()) {
        prop_assert_eq!(combine(&x, &Reference::future("x")), x);
    }

    #[test]
    fn data_value_is_never_replaced(value in proptest::collection::vec(any::<u8>(), 0..8), update in reference()) {
        let original = Reference::DataValue { id: RefId::new("x"), value };
        prop_assert_eq!(combine(&original, &update), original);
    }

    #[test]
    fn error_only_settles_a_future(x in reference()) {
        let error = Reference::error(RefId::new("x"), "WORKER_FAILED", None);
        let merged = combine(&x, &error);
        if x.is_future() {
            prop_assert_eq!(merged, error);
        } else {
            prop_assert_eq!(merged, x);
        }
    }

    #[test]
    fn concrete_merges_keep_every_location(a in nonempty_workers(), b in nonempty_workers()) {
        let merged = combine(
            &Reference::concrete("x", Some(1), a.iter().map(WorkerId::as_str)),
            &Reference::concrete("x", None, b.iter().map(WorkerId::as_str)),
        );
        let locations = merged.locations();
        prop_assert!(a.is_subset(&locations));
        prop_assert!(b.is_subset(&locations));
        prop_assert_eq!(merged.size_hint(), Some(1));
    }

    #[test]
    fn demand_driven_dag_runs_exactly_what_is_needed(
        deps in dag(8),
        flaky in proptest::collection::vec(any::<bool>(), 8),
        seed in any::<u64>(),
    ) {
        let settings = MasterSettings { rng_seed: Some(seed), ..MasterSettings::default() };
        let (mut core, _clock) = seeded_core(settings);
        core.register_worker(worker_with_slots("w1", 2));
        core.register_worker(worker("w2"));

        let n = deps.len();
        let children: Vec<TaskDescriptor> = (0..n)
            .map(|i| {
                deps[i]
                    .iter()
                    .fold(task(&format!("t{i}")), |b, d| b.after(&output_of(*d, n)))
                    .output(&output_of(i, n))
                    .build()
            })
            .collect();

        let (job, _) = core.submit_job(task("R").output("out").build(), None).unwrap();
        let mut runs: HashMap<String, usize> = HashMap::new();

        for _ in 0..100 {
            let step = core.schedule();
            let assignments: Vec<Assignment> = step.assignments().into_iter().cloned().collect();
            if assignments.is_empty() {
                break;
            }
            for a in assignments {
                let name = a.task.as_str().to_string();
                let count = {
                    let c = runs.entry(name.clone()).or_default();
                    *c += 1;
                    *c
                };
                let index: Option<usize> = name.strip_prefix('t').and_then(|i| i.parse().ok());

                let report = if name == "R" {
                    spawned_and_committed(&job, "R", &a.worker.0, children.clone(), vec![])
                } else if index.is_some_and(|i| flaky[i]) && count == 1 {
                    failed(&job, &name, &a.worker.0, FailureReason::WorkerFailed)
                } else {
                    let published = a
                        .expected_outputs
                        .iter()
                        .map(|o| Reference::concrete(o.as_str(), Some(8), [a.worker.0.as_str()]))
                        .collect();
                    committed(&job, &name, &a.worker.0, published)
                };
                core.report_completion(report).unwrap();
            }
        }

        prop_assert_eq!(core.job_status(&job).unwrap().state, JobState::Committed);

        let needed = needed(&deps);
        for i in 0..n {
            let name = format!("t{i}");
            let status = core.task_status(&job, &TaskId::new(name.as_str())).unwrap();
            let ran = runs.get(&name).copied().unwrap_or(0);
            if needed.contains(&i) {
                prop_assert_eq!(status.state, TaskState::Committed);
                prop_assert!(ran >= 1 && ran <= 2, "t{} ran {} times", i, ran);
            } else {
                prop_assert_eq!(status.state, TaskState::Created);
                prop_assert_eq!(ran, 0);
            }
        }
    }
}
