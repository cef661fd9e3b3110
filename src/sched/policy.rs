// src/sched/policy.rs

//! Placement policies: which workers should a runnable task be queued on.
//!
//! A policy only proposes candidates among the workers that are eligible for
//! the task (handler supported, capacity for the class). Tasks pinned by a
//! `Fixed` input never reach a policy.

use std::collections::BTreeMap;
use std::fmt::Debug;

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::reference::{Reference, WorkerId};
use crate::task::Task;
use crate::types::PlacementPolicyKind;

use super::worker_pool::Worker;

/// Tuning knobs of the locality policy (`[locality]` in the config file).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalitySettings {
    /// Multiplier applied to the bytes of a `Sweetheart` at its preferred
    /// location.
    pub sweetheart_factor: f64,
    /// Byte-equivalent credited to each source of a stream input.
    pub stream_source_bytes: u64,
    /// Minimum score for a worker to count as a locality candidate.
    pub min_saving_threshold: u64,
    /// Candidates within this fraction of the best score are kept.
    pub margin: f64,
}

impl Default for LocalitySettings {
    fn default() -> Self {
        Self {
            sweetheart_factor: 1000.0,
            stream_source_bytes: 10_000_000,
            min_saving_threshold: 1_048_576,
            margin: 0.9,
        }
    }
}

pub trait PlacementPolicy: Send + Debug {
    fn kind(&self) -> PlacementPolicyKind;

    /// Candidate workers for `task`, chosen from `eligible`.
    ///
    /// Returns an empty list only when `eligible` is empty.
    fn select(&self, task: &Task, eligible: &[&Worker], rng: &mut StdRng) -> Vec<WorkerId>;
}

pub fn policy_for(kind: PlacementPolicyKind, locality: LocalitySettings) -> Box<dyn PlacementPolicy> {
    match kind {
        PlacementPolicyKind::Locality => Box::new(LocalityPolicy { settings: locality }),
        PlacementPolicyKind::Random => Box::new(RandomPolicy),
        PlacementPolicyKind::Weighted => Box::new(WeightedPolicy),
        PlacementPolicyKind::TwoRandom => Box::new(TwoRandomPolicy),
    }
}

/// Uniformly random eligible worker.
#[derive(Debug, Clone, Copy)]
pub struct RandomPolicy;

impl PlacementPolicy for RandomPolicy {
    fn kind(&self) -> PlacementPolicyKind {
        PlacementPolicyKind::Random
    }

    fn select(&self, _task: &Task, eligible: &[&Worker], rng: &mut StdRng) -> Vec<WorkerId> {
        if eligible.is_empty() {
            return Vec::new();
        }
        let pick = rng.gen_range(0..eligible.len());
        vec![eligible[pick].id().clone()]
    }
}

/// Random worker, weighted by free slots in the task's class.
#[derive(Debug, Clone, Copy)]
pub struct WeightedPolicy;

impl PlacementPolicy for WeightedPolicy {
    fn kind(&self) -> PlacementPolicyKind {
        PlacementPolicyKind::Weighted
    }

    fn select(&self, task: &Task, eligible: &[&Worker], rng: &mut StdRng) -> Vec<WorkerId> {
        let class = task.scheduling_class.as_str();
        let free: Vec<f64> = eligible
            .iter()
            .map(|w| w.capacity(class) as f64 * (1.0 - w.load(class)).max(0.0))
            .collect();

        // All full: fall back to raw capacity so the task still gets queued.
        let weights = if free.iter().any(|f| *f > 0.0) {
            free
        } else {
            eligible.iter().map(|w| w.capacity(class) as f64).collect()
        };

        match WeightedIndex::new(&weights) {
            Ok(dist) => vec![eligible[dist.sample(rng)].id().clone()],
            Err(_) => RandomPolicy.select(task, eligible, rng),
        }
    }
}

/// Sample two workers, keep the less loaded one.
#[derive(Debug, Clone, Copy)]
pub struct TwoRandomPolicy;

impl PlacementPolicy for TwoRandomPolicy {
    fn kind(&self) -> PlacementPolicyKind {
        PlacementPolicyKind::TwoRandom
    }

    fn select(&self, task: &Task, eligible: &[&Worker], rng: &mut StdRng) -> Vec<WorkerId> {
        two_random_choices(task, eligible, rng).into_iter().collect()
    }
}

fn two_random_choices(task: &Task, eligible: &[&Worker], rng: &mut StdRng) -> Option<WorkerId> {
    match eligible.len() {
        0 => None,
        1 => Some(eligible[0].id().clone()),
        n => {
            let a = rng.gen_range(0..n);
            let mut b = rng.gen_range(0..n - 1);
            if b >= a {
                b += 1;
            }
            let class = task.scheduling_class.as_str();
            let pick = if eligible[b].load(class) < eligible[a].load(class) {
                b
            } else {
                a
            };
            Some(eligible[pick].id().clone())
        }
    }
}

/// Prefer workers that already hold the task's inputs.
#[derive(Debug, Clone, Copy)]
pub struct LocalityPolicy {
    pub settings: LocalitySettings,
}

impl LocalityPolicy {
    /// Bytes each eligible worker already holds, plus the workers that are a
    /// `Sweetheart`'s preferred location.
    fn scores(&self, task: &Task, eligible: &[&Worker]) -> (BTreeMap<WorkerId, f64>, Vec<WorkerId>) {
        let mut scores: BTreeMap<WorkerId, f64> = eligible
            .iter()
            .map(|w| (w.id().clone(), 0.0))
            .collect();
        let mut preferred = Vec::new();

        let mut credit = |w: &WorkerId, amount: f64| {
            if let Some(s) = scores.get_mut(w) {
                *s += amount;
            }
        };

        for input in task.bound_inputs() {
            match input {
                Reference::Sweetheart {
                    preferred: pref,
                    size_hint: Some(size),
                    hints,
                    ..
                } => {
                    credit(pref, *size as f64 * self.settings.sweetheart_factor);
                    for h in hints.iter().filter(|h| *h != pref) {
                        credit(h, *size as f64);
                    }
                    preferred.push(pref.clone());
                }
                Reference::Concrete {
                    size_hint: Some(size),
                    hints,
                    ..
                } => {
                    for h in hints {
                        credit(h, *size as f64);
                    }
                }
                Reference::Stream { hints, .. } => {
                    for h in hints {
                        credit(h, self.settings.stream_source_bytes as f64);
                    }
                }
                Reference::SocketStream { location, .. } => {
                    credit(location, self.settings.stream_source_bytes as f64);
                }
                _ => {}
            }
        }

        preferred.retain(|p| scores.contains_key(p));
        (scores, preferred)
    }
}

impl PlacementPolicy for LocalityPolicy {
    fn kind(&self) -> PlacementPolicyKind {
        PlacementPolicyKind::Locality
    }

    fn select(&self, task: &Task, eligible: &[&Worker], rng: &mut StdRng) -> Vec<WorkerId> {
        let (scores, preferred) = self.scores(task, eligible);
        let threshold = self.settings.min_saving_threshold as f64;

        let above: Vec<(&WorkerId, f64)> = scores
            .iter()
            .filter(|(w, s)| **s > 0.0 && (**s >= threshold || preferred.contains(*w)))
            .map(|(w, s)| (w, *s))
            .collect();

        let best = above.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);
        if best <= 0.0 {
            return two_random_choices(task, eligible, rng).into_iter().collect();
        }

        let cutoff = best * self.settings.margin;
        above
            .into_iter()
            .filter(|(_, s)| *s >= cutoff)
            .map(|(w, _)| w.clone())
            .collect()
    }
}
