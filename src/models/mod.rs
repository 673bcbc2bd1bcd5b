// Data models for work packages, agent profiles, and distribution plans

pub mod plan;

pub use plan::{AgentAssignment, DistributionPlan};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Implement,
    Refactor,
    Test,
    Document,
    Review,
    Integrate,
    Cleanup,
}

impl TaskType {
    /// Returns all task types
    pub fn all() -> &'static [TaskType] {
        &[
            TaskType::Implement,
            TaskType::Refactor,
            TaskType::Test,
            TaskType::Document,
            TaskType::Review,
            TaskType::Integrate,
            TaskType::Cleanup,
        ]
    }

    /// Returns the string representation of this task type
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Implement => "implement",
            TaskType::Refactor => "refactor",
            TaskType::Test => "test",
            TaskType::Document => "document",
            TaskType::Review => "review",
            TaskType::Integrate => "integrate",
            TaskType::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Smallest typed unit of work inside a work package
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type", alias = "task_type")]
    pub task_type: TaskType,
    #[serde(alias = "estimated_hours", default)]
    pub estimated_hours: f64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(alias = "required_capabilities", default)]
    pub required_capabilities: Vec<String>,
    #[serde(alias = "affected_files", default)]
    pub affected_files: Vec<String>,
    /// Lower is more urgent; only used to break ties
    #[serde(default)]
    pub priority: i32,
}

impl Task {
    pub fn new(id: impl Into<String>, task_type: TaskType, estimated_hours: f64) -> Self {
        Self {
            id: id.into(),
            task_type,
            estimated_hours,
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            affected_files: Vec::new(),
            priority: 0,
        }
    }

    /// Add files this task will modify
    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affected_files.extend(files.into_iter().map(Into::into));
        self
    }
}

/// Named, schedulable bundle of related tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkPackage {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Ids of work packages that must finish first
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Explicit effort; the sum of task hours when unset
    #[serde(alias = "estimated_hours", default)]
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub priority: i32,
}

impl WorkPackage {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tasks: Vec::new(),
            dependencies: Vec::new(),
            estimated_hours: None,
            priority: 0,
        }
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sum of task hours; drives duration estimates
    pub fn task_hours(&self) -> f64 {
        self.tasks.iter().map(|t| t.estimated_hours).sum()
    }

    /// Declared package effort, or the task sum when unset.
    /// Weights the critical path.
    pub fn total_hours(&self) -> f64 {
        self.estimated_hours.unwrap_or_else(|| self.task_hours())
    }

    /// Union of every file touched by this package's tasks
    pub fn affected_files(&self) -> BTreeSet<&str> {
        self.tasks
            .iter()
            .flat_map(|t| t.affected_files.iter().map(String::as_str))
            .collect()
    }

    /// Whether two packages touch at least one common file
    pub fn conflicts_with(&self, other: &WorkPackage) -> bool {
        !self.affected_files().is_disjoint(&other.affected_files())
    }
}

/// What one kind of agent can do and how fast
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilityProfile {
    #[serde(alias = "agent_type")]
    pub agent_type: String,
    #[serde(alias = "supported_task_types")]
    pub supported_task_types: BTreeSet<TaskType>,
    #[serde(alias = "max_concurrent_tasks", default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: u32,
    /// Relative speed, 1.0 is baseline
    #[serde(alias = "performance_multiplier", default = "default_performance_multiplier")]
    pub performance_multiplier: f64,
    #[serde(default)]
    pub specializations: Vec<String>,
}

fn default_max_concurrent_tasks() -> u32 {
    1
}

fn default_performance_multiplier() -> f64 {
    1.0
}

impl AgentCapabilityProfile {
    pub fn new(agent_type: impl Into<String>, supported: &[TaskType], multiplier: f64) -> Self {
        Self {
            agent_type: agent_type.into(),
            supported_task_types: supported.iter().copied().collect(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            performance_multiplier: multiplier,
            specializations: Vec::new(),
        }
    }

    pub fn supports(&self, task_type: TaskType) -> bool {
        self.supported_task_types.contains(&task_type)
    }

    /// Number of tasks in `tasks` this profile can handle
    pub fn coverage(&self, tasks: &[Task]) -> usize {
        tasks.iter().filter(|t| self.supports(t.task_type)).count()
    }
}

/// Ordered set of capability profiles, configured once per process.
///
/// Declaration order matters: it breaks ties during profile selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityRegistry {
    profiles: Vec<AgentCapabilityProfile>,
}

impl CapabilityRegistry {
    pub fn new(profiles: Vec<AgentCapabilityProfile>) -> Self {
        Self { profiles }
    }

    /// Registry holding the built-in profiles
    pub fn with_defaults() -> Self {
        Self::new(default_profiles())
    }

    pub fn profiles(&self) -> &[AgentCapabilityProfile] {
        &self.profiles
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn get(&self, agent_type: &str) -> Option<&AgentCapabilityProfile> {
        self.profiles.iter().find(|p| p.agent_type == agent_type)
    }

    /// Profile covering the most task types; earlier declarations win ties
    pub fn best_for(&self, tasks: &[Task]) -> Option<&AgentCapabilityProfile> {
        let mut best: Option<(&AgentCapabilityProfile, usize)> = None;
        for profile in &self.profiles {
            let coverage = profile.coverage(tasks);
            match best {
                Some((_, best_coverage)) if coverage <= best_coverage => {}
                _ => best = Some((profile, coverage)),
            }
        }
        best.map(|(profile, _)| profile)
    }
}

/// Built-in profiles. Specialists come before the general-purpose profile so
/// a package fully covered by a specialist is assigned to it.
pub fn default_profiles() -> Vec<AgentCapabilityProfile> {
    use TaskType::*;

    let mut implementer =
        AgentCapabilityProfile::new("implementation-specialist", &[Implement, Refactor, Integrate], 1.2);
    implementer.max_concurrent_tasks = 3;
    implementer.specializations = vec!["code-generation".to_string(), "refactoring".to_string()];

    let mut tester = AgentCapabilityProfile::new("test-engineer", &[Test, Review], 1.1);
    tester.max_concurrent_tasks = 2;
    tester.specializations = vec!["unit-testing".to_string(), "integration-testing".to_string()];

    let mut writer = AgentCapabilityProfile::new("documentation-writer", &[Document, Cleanup], 1.3);
    writer.max_concurrent_tasks = 2;
    writer.specializations = vec!["technical-writing".to_string()];

    let mut reviewer = AgentCapabilityProfile::new("code-reviewer", &[Review, Refactor, Cleanup], 1.0);
    reviewer.max_concurrent_tasks = 2;
    reviewer.specializations = vec!["static-analysis".to_string()];

    let general = AgentCapabilityProfile::new("general-purpose", TaskType::all(), 1.0);

    vec![implementer, tester, writer, reviewer, general]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_hours_falls_back_to_task_sum() {
        let wp = WorkPackage::new("wp", "Package")
            .with_task(Task::new("t1", TaskType::Implement, 2.0))
            .with_task(Task::new("t2", TaskType::Test, 1.5));
        assert_eq!(wp.total_hours(), 3.5);

        let mut explicit = wp.clone();
        explicit.estimated_hours = Some(10.0);
        assert_eq!(explicit.total_hours(), 10.0);
        assert_eq!(explicit.task_hours(), 3.5);
    }

    #[test]
    fn test_conflicts_with_shared_file() {
        let a = WorkPackage::new("a", "A")
            .with_task(Task::new("t", TaskType::Implement, 1.0).with_files(["src/lib.rs"]));
        let b = WorkPackage::new("b", "B")
            .with_task(Task::new("t", TaskType::Test, 1.0).with_files(["src/lib.rs", "tests/x.rs"]));
        let c = WorkPackage::new("c", "C")
            .with_task(Task::new("t", TaskType::Document, 1.0).with_files(["README.md"]));

        assert!(a.conflicts_with(&b));
        assert!(!a.conflicts_with(&c));
    }

    #[test]
    fn test_best_profile_prefers_coverage_then_declaration_order() {
        let registry = CapabilityRegistry::with_defaults();

        let tests_only = vec![Task::new("t", TaskType::Test, 1.0)];
        assert_eq!(
            registry.best_for(&tests_only).unwrap().agent_type,
            "test-engineer"
        );

        let mixed = vec![
            Task::new("t1", TaskType::Implement, 1.0),
            Task::new("t2", TaskType::Document, 1.0),
        ];
        assert_eq!(
            registry.best_for(&mixed).unwrap().agent_type,
            "general-purpose"
        );
    }

    #[test]
    fn test_task_deserializes_type_field() {
        let json = r#"{"id":"t1","type":"refactor","estimatedHours":2.5,"affectedFiles":["a.rs"]}"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.task_type, TaskType::Refactor);
        assert_eq!(task.estimated_hours, 2.5);
        assert_eq!(task.affected_files, vec!["a.rs"]);
        assert_eq!(task.priority, 0);
    }
}
