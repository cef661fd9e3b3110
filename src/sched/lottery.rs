// src/sched/lottery.rs

//! Lottery scheduling across jobs sharing a worker.
//!
//! Each job holds tickets inversely proportional to the moving average of
//! its task durations, so a job made of many short tasks wins free slots
//! more often than one made of a few long tasks.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// `[lottery]` settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LotterySettings {
    /// Weight of the newest sample in the moving average.
    pub ewma_alpha: f64,
    /// Tickets a job gets when its tasks average one millisecond.
    pub ticket_budget: f64,
}

impl Default for LotterySettings {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.3,
            ticket_budget: 100_000.0,
        }
    }
}

/// Exponentially weighted moving average of task durations, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn observe(&mut self, sample_ms: f64) {
        self.value = Some(match self.value {
            None => sample_ms,
            Some(v) => self.alpha * sample_ms + (1.0 - self.alpha) * v,
        });
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Ticket count for a job with the given duration average.
///
/// A job with no finished task yet is treated as if its tasks took one
/// second. Never below one ticket.
pub fn tickets(durations: &Ewma, budget: f64) -> u64 {
    let millis = durations.value().unwrap_or(1000.0).max(1.0);
    (budget / millis).max(1.0) as u64
}

/// Draw one entry with probability proportional to its tickets.
///
/// `None` when there is nothing to draw from or no entry holds a ticket.
pub fn draw<T>(entries: &[(T, u64)], rng: &mut StdRng) -> Option<usize> {
    let dist = WeightedIndex::<u64>::new(entries.iter().map(|(_, t)| *t)).ok()?;
    Some(dist.sample(rng))
}
