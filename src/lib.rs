// Clippy allows for reasonable defaults
// These suppress warnings where the suggested change doesn't improve readability
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::derivable_impls)] // Explicit Default impls can be clearer
#![allow(clippy::unnecessary_map_or)] // map_or can be clearer than alternatives
#![allow(clippy::redundant_closure)] // |x| f(x) can be clearer than f
#![allow(clippy::unwrap_or_default)] // unwrap_or_else(Default::default) can be clearer

// Module declarations
pub mod config;
pub mod coordination;
pub mod distribution;
pub mod file_storage;
pub mod models;
pub mod shutdown;
mod utils;

// Re-export models for use by callers
pub use models::*;

use anyhow::Result;
use config::{ConfigLoader, CoordinatorConfig};
use coordination::{
    AgentLifecycle, AgentRegistry, ConflictResolver, LockManager, MessageQueue, ResourceMonitor,
};
use distribution::{PlanError, WorkDistributionEngine};
use file_storage::{FsMarkerStore, MarkerStore};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Per-process handle owning configuration, storage, and capability profiles.
///
/// Built once by the entry point; every service is handed out from here.
#[derive(Clone)]
pub struct Coordinator {
    config: CoordinatorConfig,
    root: Option<PathBuf>,
    store: Arc<dyn MarkerStore>,
    capabilities: CapabilityRegistry,
}

impl Coordinator {
    /// Load config for `project_path` and open its on-disk store
    pub fn open(project_path: &Path) -> Result<Self> {
        let config = ConfigLoader::new().with_project_path(project_path).load()?;
        let root = config
            .storage
            .root
            .clone()
            .unwrap_or_else(|| file_storage::get_fleet_dir(project_path));
        Self::with_root(config, &root)
    }

    /// Open an on-disk store at `root` with explicit config
    pub fn with_root(config: CoordinatorConfig, root: &Path) -> Result<Self> {
        let root = file_storage::init_fleet_dir(root).map_err(|e| anyhow::anyhow!(e))?;
        log::debug!("Using coordination store at {}", root.display());

        Ok(Self {
            capabilities: config.capability_registry(),
            store: Arc::new(FsMarkerStore::new(&root)),
            root: Some(root),
            config,
        })
    }

    /// Use any store backend (in-memory for tests and embedding)
    pub fn with_store(config: CoordinatorConfig, store: Arc<dyn MarkerStore>) -> Self {
        Self {
            capabilities: config.capability_registry(),
            store,
            root: None,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Storage root, `None` for non-filesystem stores
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn store(&self) -> Arc<dyn MarkerStore> {
        self.store.clone()
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn engine(&self) -> WorkDistributionEngine {
        WorkDistributionEngine::new(self.capabilities.clone())
            .with_unsupported_task_penalty(self.config.planning.unsupported_task_penalty_hours)
    }

    /// Plan `packages` (minus `completed`), capped at `max_agents` or the
    /// configured cap
    pub fn plan(
        &self,
        packages: &[WorkPackage],
        completed: &HashSet<String>,
        max_agents: Option<usize>,
    ) -> std::result::Result<DistributionPlan, PlanError> {
        let engine = self.engine();
        let plan = engine.plan_remaining(packages, completed)?;
        Ok(match max_agents.or(self.config.planning.max_agents) {
            Some(cap) => engine.optimize_distribution(&plan, cap),
            None => plan,
        })
    }

    pub fn registry(&self) -> AgentRegistry {
        AgentRegistry::new(self.store.clone())
    }

    pub fn lock_manager(&self, holder_id: &str) -> LockManager {
        LockManager::new(self.store.clone(), holder_id, self.config.locks.settings())
    }

    pub fn message_queue(&self, agent_id: &str) -> MessageQueue {
        MessageQueue::new(
            self.store.clone(),
            agent_id,
            Duration::from_millis(self.config.messages.poll_interval_ms),
        )
    }

    pub fn resource_monitor(&self, agent_id: &str) -> ResourceMonitor {
        ResourceMonitor::new(
            self.store.clone(),
            agent_id,
            self.config.resources.limits,
            self.config.resources.window_size,
        )
    }

    /// Resource monitor that samples and reports at the configured interval
    /// when called inside a tokio runtime
    pub fn start_resource_monitor(&self, agent_id: &str) -> ResourceMonitor {
        let monitor = self.resource_monitor(agent_id);
        if tokio::runtime::Handle::try_current().is_ok() {
            monitor.start_sampling(Duration::from_secs(self.config.resources.sample_interval_secs));
        }
        monitor
    }

    pub fn conflict_resolver(&self) -> ConflictResolver {
        ConflictResolver::new(self.store.clone())
    }

    /// Register an agent whose locks and record are released on every exit
    /// path; heartbeats start when called inside a tokio runtime
    pub fn start_agent(
        &self,
        agent_id: &str,
        agent_type: &str,
        work_package_id: Option<&str>,
    ) -> Result<AgentLifecycle> {
        let mut lifecycle =
            AgentLifecycle::start(self.registry(), agent_id, agent_type, work_package_id, BTreeMap::new())?
                .with_lock_manager(self.lock_manager(agent_id));

        if tokio::runtime::Handle::try_current().is_ok() {
            lifecycle.spawn_heartbeat(Duration::from_secs(self.config.registry.heartbeat_interval_secs));
        }
        Ok(lifecycle)
    }

    /// Reap agents whose heartbeat is older than the configured timeout
    pub fn reap_stale_agents(&self) -> Vec<String> {
        self.registry()
            .cleanup_stale_agents(Duration::from_secs(self.config.registry.stale_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use file_storage::MemoryMarkerStore;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_store_under_project() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = Coordinator::open(temp_dir.path()).unwrap();

        assert_eq!(coordinator.root(), Some(temp_dir.path().join(".fleet").as_path()));
        assert!(temp_dir.path().join(".fleet").join(".gitignore").exists());
        assert!(!coordinator.capabilities().is_empty());
    }

    #[test]
    fn test_services_share_one_store() {
        let coordinator =
            Coordinator::with_store(CoordinatorConfig::default(), Arc::new(MemoryMarkerStore::new()));

        let lifecycle = coordinator.start_agent("agent-1", "general-purpose", Some("WP-1")).unwrap();
        assert!(coordinator.lock_manager("agent-1").acquire("res", Duration::ZERO, false));
        assert_eq!(coordinator.registry().list_active_agents().len(), 1);

        drop(lifecycle);
        assert!(coordinator.registry().list_active_agents().is_empty());
        assert!(coordinator.lock_manager("agent-2").acquire("res", Duration::ZERO, false));
    }

    #[tokio::test]
    async fn test_resource_monitor_reports_on_configured_interval() {
        let mut config = CoordinatorConfig::default();
        config.resources.sample_interval_secs = 1;
        let coordinator = Coordinator::with_store(config, Arc::new(MemoryMarkerStore::new()));

        let monitor = coordinator.start_resource_monitor("agent-1");
        assert!(monitor.is_sampling());
        // First tick fires immediately
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(monitor.read_usage_report("agent-1").is_some());

        assert!(monitor.stop_sampling());
    }

    #[test]
    fn test_resource_monitor_without_runtime_does_not_sample() {
        let coordinator =
            Coordinator::with_store(CoordinatorConfig::default(), Arc::new(MemoryMarkerStore::new()));
        assert!(!coordinator.start_resource_monitor("agent-1").is_sampling());
    }

    #[test]
    fn test_plan_applies_configured_cap() {
        let mut config = CoordinatorConfig::default();
        config.planning.max_agents = Some(1);
        let coordinator = Coordinator::with_store(config, Arc::new(MemoryMarkerStore::new()));

        let packages = vec![
            WorkPackage::new("a", "A").with_task(Task::new("t", TaskType::Implement, 1.0)),
            WorkPackage::new("b", "B").with_task(Task::new("t", TaskType::Test, 1.0)),
        ];
        let plan = coordinator.plan(&packages, &HashSet::new(), None).unwrap();
        assert_eq!(plan.total_agents_needed, 1);

        let uncapped = coordinator.plan(&packages, &HashSet::new(), Some(8)).unwrap();
        assert_eq!(uncapped.total_agents_needed, 2);
    }
}
