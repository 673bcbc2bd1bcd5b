//! Work distribution: dependency analysis, conflict-aware grouping, and
//! agent assignment for sets of work packages

pub mod coloring;
pub mod dependency;
pub mod engine;

pub use dependency::{DependencyCycle, DependencyGraph, DependencyStats};
pub use engine::{PlanError, WorkDistributionEngine, DEFAULT_UNSUPPORTED_TASK_PENALTY_HOURS};
