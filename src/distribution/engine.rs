// Work distribution engine: turns work packages into a parallel execution plan

use super::coloring::{split_by_file_conflicts, stable_order};
use super::dependency::DependencyGraph;
use crate::models::{
    AgentAssignment, AgentCapabilityProfile, CapabilityRegistry, DistributionPlan, WorkPackage,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

/// Extra hours charged for each task the chosen profile does not support
pub const DEFAULT_UNSUPPORTED_TASK_PENALTY_HOURS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("Dependency cycle detected: {}", .cycle.join(" → "))]
    CycleDetected { cycle: Vec<String> },

    #[error("Work package submitted more than once: {0}")]
    DuplicatePackage(String),

    #[error("No agent capability profiles are configured")]
    NoProfiles,
}

/// Builds [`DistributionPlan`]s. Planning is pure: no I/O and no state is
/// shared between calls.
#[derive(Debug, Clone)]
pub struct WorkDistributionEngine {
    registry: CapabilityRegistry,
    unsupported_task_penalty_hours: f64,
}

impl WorkDistributionEngine {
    pub fn new(registry: CapabilityRegistry) -> Self {
        Self {
            registry,
            unsupported_task_penalty_hours: DEFAULT_UNSUPPORTED_TASK_PENALTY_HOURS,
        }
    }

    pub fn with_unsupported_task_penalty(mut self, hours: f64) -> Self {
        self.unsupported_task_penalty_hours = hours.max(0.0);
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Compute a conflict-free parallel plan for `packages`.
    ///
    /// Dependencies on ids outside `packages` count as already satisfied.
    pub fn plan(&self, packages: &[WorkPackage]) -> Result<DistributionPlan, PlanError> {
        if self.registry.is_empty() {
            return Err(PlanError::NoProfiles);
        }

        let mut by_id: HashMap<&str, &WorkPackage> = HashMap::with_capacity(packages.len());
        for wp in packages {
            if by_id.insert(wp.id.as_str(), wp).is_some() {
                return Err(PlanError::DuplicatePackage(wp.id.clone()));
            }
        }

        let graph = build_graph(packages, &by_id);
        let order = graph
            .execution_order()
            .map_err(|cycle| PlanError::CycleDetected { cycle: cycle.0 })?;
        let levels = graph.levels(&order);

        let mut by_level: BTreeMap<usize, Vec<&WorkPackage>> = BTreeMap::new();
        for (id, level) in &levels {
            if let Some(&wp) = by_id.get(id.as_str()) {
                by_level.entry(*level).or_default().push(wp);
            }
        }

        let mut parallel_groups: Vec<Vec<AgentAssignment>> = Vec::new();
        for (level, mut members) in by_level {
            stable_order(&mut members);
            let sub_groups = split_by_file_conflicts(&members);
            if sub_groups.len() > 1 {
                log::debug!(
                    "Level {} split into {} sub-groups by file conflicts",
                    level,
                    sub_groups.len()
                );
            }

            for sub_group in sub_groups {
                let group_index = parallel_groups.len();
                let assignments = sub_group
                    .into_iter()
                    .map(|wp| self.assign(wp, group_index))
                    .collect::<Result<Vec<_>, _>>()?;
                parallel_groups.push(assignments);
            }
        }

        let critical_path = critical_path(&graph, &order, &by_id);

        let mut plan = DistributionPlan {
            parallel_groups,
            total_agents_needed: 0,
            total_estimated_hours: 0.0,
            critical_path,
            dependency_graph: graph.depends_on.clone(),
            levels,
        };
        plan.recompute_totals();

        let stats = graph.stats();
        log::debug!(
            "Planned {} packages ({} edges, depth {}) into {} groups, {} agents, {:.1}h",
            stats.total_nodes,
            stats.total_dependencies,
            stats.max_depth,
            plan.parallel_groups.len(),
            plan.total_agents_needed,
            plan.total_estimated_hours
        );

        Ok(plan)
    }

    /// Plan only the packages not in `completed`.
    ///
    /// Used to re-plan after agents are reaped and their packages orphaned.
    pub fn plan_remaining(
        &self,
        packages: &[WorkPackage],
        completed: &HashSet<String>,
    ) -> Result<DistributionPlan, PlanError> {
        let remaining: Vec<WorkPackage> = packages
            .iter()
            .filter(|wp| !completed.contains(&wp.id))
            .cloned()
            .collect();

        log::info!(
            "Re-planning {} of {} packages ({} completed)",
            remaining.len(),
            packages.len(),
            packages.len() - remaining.len()
        );
        self.plan(&remaining)
    }

    /// Cap concurrency at `max_agents` by splitting oversized groups into
    /// ordered chunks. Never fails; a cap of 0 is treated as 1.
    pub fn optimize_distribution(&self, plan: &DistributionPlan, max_agents: usize) -> DistributionPlan {
        let max_agents = max_agents.max(1);

        let mut optimized = plan.clone();
        optimized.parallel_groups = plan
            .parallel_groups
            .iter()
            .flat_map(|group| group.chunks(max_agents).map(<[AgentAssignment]>::to_vec))
            .collect();
        optimized.recompute_totals();

        if optimized.parallel_groups.len() != plan.parallel_groups.len() {
            log::debug!(
                "Capped plan at {} agents: {} -> {} groups, {:.1}h -> {:.1}h",
                max_agents,
                plan.parallel_groups.len(),
                optimized.parallel_groups.len(),
                plan.total_estimated_hours,
                optimized.total_estimated_hours
            );
        }

        optimized
    }

    /// Estimated hours for `wp` when run by `profile`
    pub fn estimate_hours(&self, wp: &WorkPackage, profile: &AgentCapabilityProfile) -> f64 {
        let multiplier = if profile.performance_multiplier > 0.0 {
            profile.performance_multiplier
        } else {
            1.0
        };
        let unsupported = wp.tasks.len() - profile.coverage(&wp.tasks);

        wp.task_hours() / multiplier + unsupported as f64 * self.unsupported_task_penalty_hours
    }

    fn assign(&self, wp: &WorkPackage, parallel_group: usize) -> Result<AgentAssignment, PlanError> {
        let profile = self.registry.best_for(&wp.tasks).ok_or(PlanError::NoProfiles)?;

        Ok(AgentAssignment {
            work_package_id: wp.id.clone(),
            work_package_name: wp.name.clone(),
            agent_type: profile.agent_type.clone(),
            tasks: wp.tasks.clone(),
            affected_files: wp.affected_files().into_iter().map(str::to_string).collect(),
            estimated_hours: self.estimate_hours(wp, profile),
            parallel_group,
        })
    }
}

fn build_graph(packages: &[WorkPackage], by_id: &HashMap<&str, &WorkPackage>) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for wp in packages {
        graph.add_node(&wp.id);
        for dep in &wp.dependencies {
            if by_id.contains_key(dep.as_str()) {
                graph.add_dependency(&wp.id, dep);
            } else {
                log::debug!("Ignoring dependency {} -> {} outside the planned set", wp.id, dep);
            }
        }
    }
    graph
}

/// Longest chain by cumulative package hours.
///
/// Ties between predecessors and between end points go to the earlier id.
fn critical_path(
    graph: &DependencyGraph,
    order: &[String],
    by_id: &HashMap<&str, &WorkPackage>,
) -> Vec<String> {
    let mut cumulative: HashMap<&str, f64> = HashMap::with_capacity(order.len());
    let mut predecessor: HashMap<&str, &str> = HashMap::new();

    for id in order {
        let own = by_id.get(id.as_str()).map(|wp| wp.total_hours()).unwrap_or(0.0);

        let mut deps: Vec<&str> = graph.get_dependencies(id).iter().map(String::as_str).collect();
        deps.sort_unstable();

        let mut best: Option<(&str, f64)> = None;
        for dep in deps {
            let value = cumulative.get(dep).copied().unwrap_or(0.0);
            match best {
                Some((_, best_value)) if value <= best_value => {}
                _ => best = Some((dep, value)),
            }
        }

        if let Some((dep, _)) = best {
            predecessor.insert(id.as_str(), dep);
        }
        cumulative.insert(id.as_str(), own + best.map(|(_, v)| v).unwrap_or(0.0));
    }

    let mut ends: Vec<&str> = order.iter().map(String::as_str).collect();
    ends.sort_unstable();
    let mut end: Option<(&str, f64)> = None;
    for id in ends {
        let value = cumulative.get(id).copied().unwrap_or(0.0);
        match end {
            Some((_, best_value)) if value <= best_value => {}
            _ => end = Some((id, value)),
        }
    }

    let mut path = Vec::new();
    let mut current = end.map(|(id, _)| id);
    while let Some(id) = current {
        path.push(id.to_string());
        current = predecessor.get(id).copied();
    }
    path.reverse();
    path
}
