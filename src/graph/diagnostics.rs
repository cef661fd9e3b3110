// src/graph/diagnostics.rs

//! Read-only checks over a job's graph.

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;

use crate::task::{TaskId, TaskState};

use super::TaskGraph;

impl TaskGraph {
    /// Find a set of blocked tasks that wait on each other's outputs.
    ///
    /// Such a job can never make progress. Edges run from each `BLOCKING`
    /// task to the producers of its unresolved inputs; a strongly connected
    /// component with more than one task, or a task waiting on itself, is a
    /// cycle. Returns the members of the first cycle found, sorted.
    pub fn blocked_cycle(&self) -> Option<Vec<TaskId>> {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

        for task in self.tasks().filter(|t| t.state == TaskState::Blocking) {
            graph.add_node(task.id.as_str());
            for waiting in &task.unresolved {
                let Some(producer) = self.producer_of(waiting) else {
                    continue;
                };
                let blocked = self
                    .task(producer)
                    .is_some_and(|p| p.state == TaskState::Blocking);
                if blocked {
                    graph.add_edge(task.id.as_str(), producer.as_str(), ());
                }
            }
        }

        tarjan_scc(&graph)
            .into_iter()
            .find(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .map(|scc| {
                let mut ids: Vec<TaskId> = scc.into_iter().map(TaskId::new).collect();
                ids.sort();
                ids
            })
    }
}
