//! Dependency graph with Kahn's algorithm for topological sorting
//!
//! Provides cycle detection, execution ordering, and dependency levels for
//! work packages. All maps are ordered so every traversal is deterministic.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A dependency cycle, listed so that the first and last ids are equal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCycle(pub Vec<String>);

impl std::fmt::Display for DependencyCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cycle detected: {}", self.0.join(" → "))
    }
}

impl std::error::Error for DependencyCycle {}

/// Dependency graph for work package ordering
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyGraph {
    /// Maps each node to the nodes it depends on
    pub depends_on: BTreeMap<String, Vec<String>>,
    /// Maps each node to the nodes blocked by it
    pub blocks: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Create a new empty dependency graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with no edges (no-op if present)
    pub fn add_node(&mut self, id: &str) {
        self.depends_on.entry(id.to_string()).or_default();
        self.blocks.entry(id.to_string()).or_default();
    }

    /// Add a dependency: `id` depends on `depends_on_id`.
    /// A self-dependency is recorded and later reported as a cycle.
    pub fn add_dependency(&mut self, id: &str, depends_on_id: &str) {
        self.add_node(id);
        self.add_node(depends_on_id);

        let deps = self.depends_on.entry(id.to_string()).or_default();
        if deps.iter().any(|d| d == depends_on_id) {
            return;
        }
        deps.push(depends_on_id.to_string());

        self.blocks
            .entry(depends_on_id.to_string())
            .or_default()
            .push(id.to_string());
    }

    pub fn len(&self) -> usize {
        self.depends_on.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depends_on.is_empty()
    }

    /// Get all nodes that `id` depends on
    pub fn get_dependencies(&self, id: &str) -> &[String] {
        self.depends_on.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Get all nodes blocked by `id`
    pub fn get_blocked_by(&self, id: &str) -> &[String] {
        self.blocks.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Validate the graph for cycles using DFS
    pub fn validate(&self) -> Result<(), DependencyCycle> {
        // Track visited nodes and nodes in current path
        let mut visited: BTreeSet<&String> = BTreeSet::new();
        let mut in_path: BTreeSet<&String> = BTreeSet::new();
        let mut path: Vec<&String> = Vec::new();

        for node in self.depends_on.keys() {
            if !visited.contains(node) {
                if let Some(cycle) =
                    self.dfs_cycle_detect(node, &mut visited, &mut in_path, &mut path)
                {
                    return Err(DependencyCycle(
                        cycle.into_iter().map(|s| s.to_string()).collect(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// DFS helper for cycle detection
    fn dfs_cycle_detect<'a>(
        &'a self,
        node: &'a String,
        visited: &mut BTreeSet<&'a String>,
        in_path: &mut BTreeSet<&'a String>,
        path: &mut Vec<&'a String>,
    ) -> Option<Vec<&'a String>> {
        visited.insert(node);
        in_path.insert(node);
        path.push(node);

        if let Some(deps) = self.depends_on.get(node) {
            for dep in deps {
                if in_path.contains(dep) {
                    // Found a cycle - extract it from the current path
                    let cycle_start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<&String> = path[cycle_start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }

                if !visited.contains(dep) {
                    if let Some(cycle) = self.dfs_cycle_detect(dep, visited, in_path, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        in_path.remove(node);
        path.pop();
        None
    }

    /// Get execution order using Kahn's algorithm (topological sort).
    ///
    /// Nodes that become ready at the same time are emitted in id order.
    pub fn execution_order(&self) -> Result<Vec<String>, DependencyCycle> {
        self.validate()?;

        // In-degree = number of dependencies
        let mut in_degree: BTreeMap<&str, usize> = self
            .depends_on
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.len()))
            .collect();

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(node, _)| *node)
            .collect();

        let mut result: Vec<String> = Vec::with_capacity(self.len());

        while let Some(node) = queue.pop_front() {
            result.push(node.to_string());

            let mut newly_ready: Vec<&str> = Vec::new();
            for blocked in self.get_blocked_by(node) {
                if let Some(degree) = in_degree.get_mut(blocked.as_str()) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        newly_ready.push(blocked.as_str());
                    }
                }
            }
            newly_ready.sort_unstable();
            queue.extend(newly_ready);
        }

        // validate() already rejected cycles, so every node is emitted
        debug_assert_eq!(result.len(), self.len());
        Ok(result)
    }

    /// Level of each node: 0 without dependencies, else 1 + max level of its dependencies
    pub fn levels(&self, order: &[String]) -> BTreeMap<String, usize> {
        let mut levels: BTreeMap<String, usize> = BTreeMap::new();
        for node in order {
            let level = self
                .get_dependencies(node)
                .iter()
                .filter_map(|dep| levels.get(dep))
                .map(|level| level + 1)
                .max()
                .unwrap_or(0);
            levels.insert(node.clone(), level);
        }
        levels
    }

    /// Get statistics about the dependency graph
    pub fn stats(&self) -> DependencyStats {
        let total_dependencies: usize = self.depends_on.values().map(Vec::len).sum();

        let root_nodes: Vec<String> = self
            .depends_on
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(n, _)| n.clone())
            .collect();

        let leaf_nodes: Vec<String> = self
            .depends_on
            .keys()
            .filter(|n| self.get_blocked_by(n).is_empty())
            .cloned()
            .collect();

        let max_depth = self
            .execution_order()
            .map(|order| self.levels(&order).into_values().max().unwrap_or(0))
            .unwrap_or(0);

        DependencyStats {
            total_nodes: self.len(),
            total_dependencies,
            max_depth,
            root_nodes,
            leaf_nodes,
        }
    }
}

/// Statistics about a dependency graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyStats {
    /// Total number of nodes
    pub total_nodes: usize,
    /// Total number of dependency edges
    pub total_dependencies: usize,
    /// Maximum depth of the dependency chain (0 for an acyclic graph without edges)
    pub max_depth: usize,
    /// Nodes with no dependencies (can start immediately)
    pub root_nodes: Vec<String>,
    /// Nodes that nothing depends on (end points)
    pub leaf_nodes: Vec<String>,
}
