//! Output types of the work distribution engine

use super::Task;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One work package bound to the agent type chosen to carry it out
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentAssignment {
    pub work_package_id: String,
    pub work_package_name: String,
    pub agent_type: String,
    pub tasks: Vec<Task>,
    /// Sorted union of files touched by `tasks`
    pub affected_files: Vec<String>,
    pub estimated_hours: f64,
    /// Index into [`DistributionPlan::parallel_groups`]
    pub parallel_group: usize,
}

/// Immutable result of one planning call.
///
/// Groups run one after another; assignments inside a group run concurrently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DistributionPlan {
    pub parallel_groups: Vec<Vec<AgentAssignment>>,
    /// Peak number of agents running at once
    pub total_agents_needed: usize,
    pub total_estimated_hours: f64,
    /// Longest dependency-weighted chain of work package ids
    pub critical_path: Vec<String>,
    /// Work package id -> ids it depends on (within the planned set)
    pub dependency_graph: BTreeMap<String, Vec<String>>,
    /// Work package id -> dependency level
    pub levels: BTreeMap<String, usize>,
}

impl DistributionPlan {
    /// Iterate every assignment in group order
    pub fn assignments(&self) -> impl Iterator<Item = &AgentAssignment> {
        self.parallel_groups.iter().flatten()
    }

    pub fn assignment_count(&self) -> usize {
        self.parallel_groups.iter().map(Vec::len).sum()
    }

    pub fn assignment_for(&self, work_package_id: &str) -> Option<&AgentAssignment> {
        self.assignments()
            .find(|a| a.work_package_id == work_package_id)
    }

    /// Work packages not yet completed whose dependencies all are
    pub fn ready_packages(&self, completed: &HashSet<String>) -> Vec<String> {
        self.assignments()
            .map(|a| a.work_package_id.as_str())
            .filter(|id| !completed.contains(*id))
            .filter(|id| {
                self.dependency_graph
                    .get(*id)
                    .map(|deps| deps.iter().all(|d| completed.contains(d)))
                    .unwrap_or(true)
            })
            .map(str::to_string)
            .collect()
    }

    /// Recompute the derived totals from `parallel_groups`
    pub(crate) fn recompute_totals(&mut self) {
        for (index, group) in self.parallel_groups.iter_mut().enumerate() {
            for assignment in group.iter_mut() {
                assignment.parallel_group = index;
            }
        }

        self.total_agents_needed = self
            .parallel_groups
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0);

        self.total_estimated_hours = self
            .parallel_groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|a| a.estimated_hours)
                    .fold(0.0_f64, f64::max)
            })
            .sum();
    }
}
