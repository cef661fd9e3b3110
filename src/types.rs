// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Scheduling class a task runs in when its descriptor names none.
pub const DEFAULT_SCHEDULING_CLASS: &str = "default";

/// Which placement policy a job uses to pick candidate workers.
///
/// - `Locality`: prefer workers already holding the task's inputs, weighted
///   by size (default).
/// - `Random`: any eligible worker, uniformly.
/// - `Weighted`: random, weighted by the worker's capacity for the class.
/// - `TwoRandom`: sample two eligible workers, keep the less loaded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicyKind {
    #[default]
    Locality,
    Random,
    Weighted,
    TwoRandom,
}

impl FromStr for PlacementPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "locality" => Ok(PlacementPolicyKind::Locality),
            "random" => Ok(PlacementPolicyKind::Random),
            "weighted" => Ok(PlacementPolicyKind::Weighted),
            "two_random" | "two-random" => Ok(PlacementPolicyKind::TwoRandom),
            other => Err(format!(
                "invalid placement policy: {other} (expected \"locality\", \"random\", \"weighted\" or \"two_random\")"
            )),
        }
    }
}

impl fmt::Display for PlacementPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlacementPolicyKind::Locality => "locality",
            PlacementPolicyKind::Random => "random",
            PlacementPolicyKind::Weighted => "weighted",
            PlacementPolicyKind::TwoRandom => "two_random",
        };
        f.write_str(s)
    }
}
