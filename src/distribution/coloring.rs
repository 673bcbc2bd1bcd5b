//! File-conflict grouping for work packages that share a dependency level
//!
//! Two packages conflict when their tasks touch a common file. Packages are
//! greedily colored in the order given: each takes the lowest color not used
//! by an already-colored conflicting package. Each color becomes one
//! sequential sub-group, so no sub-group contains two packages sharing a file.

use crate::models::WorkPackage;
use std::collections::BTreeSet;

/// Sort key used before coloring so plans are reproducible
pub fn stable_order(packages: &mut [&WorkPackage]) {
    packages.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
}

/// Color index per package, aligned with `packages`
pub fn color_packages(packages: &[&WorkPackage]) -> Vec<usize> {
    let mut colors: Vec<usize> = Vec::with_capacity(packages.len());

    for (i, wp) in packages.iter().enumerate() {
        let used: BTreeSet<usize> = (0..i)
            .filter(|&j| wp.conflicts_with(packages[j]))
            .map(|j| colors[j])
            .collect();

        let color = (0..).find(|c| !used.contains(c)).unwrap_or(0);
        colors.push(color);
    }

    colors
}

/// Split packages into conflict-free sub-groups, ordered by color
pub fn split_by_file_conflicts<'a>(packages: &[&'a WorkPackage]) -> Vec<Vec<&'a WorkPackage>> {
    let colors = color_packages(packages);
    let group_count = colors.iter().max().map(|c| c + 1).unwrap_or(0);

    let mut groups: Vec<Vec<&WorkPackage>> = vec![Vec::new(); group_count];
    for (wp, color) in packages.iter().zip(colors) {
        groups[color].push(*wp);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Task, TaskType};

    fn package(id: &str, files: &[&str]) -> WorkPackage {
        WorkPackage::new(id, id).with_task(
            Task::new(format!("{}-t", id), TaskType::Implement, 1.0).with_files(files.iter().copied()),
        )
    }

    #[test]
    fn test_disjoint_packages_share_one_group() {
        let a = package("a", &["a.rs"]);
        let b = package("b", &["b.rs"]);
        let c = package("c", &[]);

        let groups = split_by_file_conflicts(&[&a, &b, &c]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[test]
    fn test_conflicting_packages_are_separated() {
        let a = package("a", &["shared.rs"]);
        let b = package("b", &["shared.rs"]);
        let c = package("c", &["other.rs"]);

        let groups = split_by_file_conflicts(&[&a, &b, &c]);
        let ids: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|wp| wp.id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a", "c"], vec!["b"]]);
    }

    #[test]
    fn test_greedy_reuses_lowest_free_color() {
        // a-b and b-c conflict, a and c do not: a and c share color 0
        let a = package("a", &["x.rs"]);
        let b = package("b", &["x.rs", "y.rs"]);
        let c = package("c", &["y.rs"]);

        assert_eq!(color_packages(&[&a, &b, &c]), vec![0, 1, 0]);
    }

    #[test]
    fn test_stable_order_uses_priority_then_id() {
        let a = package("a", &[]).with_priority(2);
        let b = package("b", &[]).with_priority(1);
        let c = package("c", &[]).with_priority(1);

        let mut packages = vec![&a, &c, &b];
        stable_order(&mut packages);
        let ids: Vec<&str> = packages.iter().map(|wp| wp.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }
}
