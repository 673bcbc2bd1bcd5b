//! Agent lifecycle guard
//!
//! Registers an agent on start and guarantees deregistration on every exit
//! path: explicit shutdown, a termination signal, an early return, or a panic
//! unwinding through the owner. Locks held by the agent are released with it.

use super::lock::LockManager;
use super::registry::AgentRegistry;
use crate::shutdown::{register_signal_handlers, ShutdownHandler, ShutdownResult, ShutdownState};
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct AgentLifecycle {
    agent_id: String,
    registry: AgentRegistry,
    locks: Option<LockManager>,
    shutdown: ShutdownState,
    /// Cleared by whichever exit path deregisters first
    registered: Arc<AtomicBool>,
    heartbeat_tx: Option<mpsc::Sender<()>>,
}

impl AgentLifecycle {
    /// Register the agent and return its guard
    pub fn start(
        registry: AgentRegistry,
        agent_id: &str,
        agent_type: &str,
        work_package_id: Option<&str>,
        metadata: BTreeMap<String, Value>,
    ) -> Result<Self> {
        if !registry.register(agent_id, agent_type, work_package_id, metadata) {
            return Err(anyhow!("Failed to register agent {}", agent_id));
        }

        Ok(Self {
            agent_id: agent_id.to_string(),
            registry,
            locks: None,
            shutdown: ShutdownState::new(),
            registered: Arc::new(AtomicBool::new(true)),
            heartbeat_tx: None,
        })
    }

    /// Release this agent's locks when it exits
    pub fn with_lock_manager(mut self, locks: LockManager) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn shutdown_state(&self) -> &ShutdownState {
        &self.shutdown
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Heartbeat every `interval` on the current tokio runtime.
    ///
    /// Returns `false` without a runtime or if a heartbeat task is running.
    /// The task ends on shutdown or once the record disappears (reaped).
    pub fn spawn_heartbeat(&mut self, interval: Duration) -> bool {
        if self.heartbeat_tx.is_some() {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No tokio runtime; heartbeat for {} not started", self.agent_id);
            return false;
        };

        let (tx, mut rx) = mpsc::channel::<()>(1);
        let registry = self.registry.clone();
        let agent_id = self.agent_id.clone();
        let shutdown = self.shutdown.clone();
        let interval = interval.max(Duration::from_millis(1));

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately; registration already stamped us
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if shutdown.is_shutdown_requested() {
                            break;
                        }
                        let (tick_registry, tick_id) = (registry.clone(), agent_id.clone());
                        // A lost compare-and-replace is fine while the record exists
                        let alive = tokio::task::spawn_blocking(move || {
                            tick_registry.heartbeat(&tick_id) || tick_registry.get_agent(&tick_id).is_some()
                        })
                        .await
                        .unwrap_or(false);
                        if !alive {
                            log::warn!("Agent {} is no longer registered; stopping heartbeat", agent_id);
                            break;
                        }
                    }
                    _ = rx.recv() => {
                        log::debug!("Heartbeat for {} shutting down", agent_id);
                        break;
                    }
                }
            }
        });

        self.heartbeat_tx = Some(tx);
        true
    }

    /// Deregister (and release locks) when SIGINT/SIGTERM/SIGHUP arrives.
    ///
    /// The process keeps running; owners should poll
    /// [`ShutdownState::is_shutdown_requested`] and exit.
    pub fn install_signal_handlers(&self) -> Result<()> {
        let registry = self.registry.clone();
        let locks = self.locks.clone();
        let agent_id = self.agent_id.clone();
        let registered = self.registered.clone();

        register_signal_handlers(self.shutdown.clone(), move || {
            let result = release_agent(&registry, locks.as_ref(), &agent_id, &registered);
            log::info!(
                "Signal cleanup for {}: {} deregistered, {} locks released",
                agent_id,
                result.agents_deregistered,
                result.locks_released
            );
        })
    }

    /// Stop heartbeats, release locks, and deregister
    pub fn shutdown(&mut self) -> Result<ShutdownResult> {
        self.stop_heartbeat();
        let handler = ShutdownHandler::with_state(self.shutdown.clone());
        handler.handle_shutdown(|| {
            Ok(release_agent(
                &self.registry,
                self.locks.as_ref(),
                &self.agent_id,
                &self.registered,
            ))
        })
    }

    fn stop_heartbeat(&mut self) {
        if let Some(tx) = self.heartbeat_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

impl Drop for AgentLifecycle {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if self.is_registered() {
            log::debug!("Agent {} dropped while registered; cleaning up", self.agent_id);
            release_agent(
                &self.registry,
                self.locks.as_ref(),
                &self.agent_id,
                &self.registered,
            );
        }
    }
}

/// Release locks and deregister exactly once across all exit paths
fn release_agent(
    registry: &AgentRegistry,
    locks: Option<&LockManager>,
    agent_id: &str,
    registered: &AtomicBool,
) -> ShutdownResult {
    let mut result = ShutdownResult::new();
    if !registered.swap(false, Ordering::SeqCst) {
        return result;
    }

    if let Some(locks) = locks {
        result.locks_released = locks.release_all();
    }

    if registry.deregister(agent_id) {
        result.agents_deregistered = 1;
    } else if registry.get_agent(agent_id).is_some() {
        result
            .errors
            .push(format!("Failed to remove registry record for {}", agent_id));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::lock::LockSettings;
    use crate::file_storage::{MarkerStore, MemoryMarkerStore};

    fn setup() -> (Arc<dyn MarkerStore>, AgentRegistry) {
        let store: Arc<dyn MarkerStore> = Arc::new(MemoryMarkerStore::new());
        let registry = AgentRegistry::new(store.clone());
        (store, registry)
    }

    #[test]
    fn test_start_registers_and_shutdown_deregisters() {
        let (store, registry) = setup();
        let locks = LockManager::new(store, "agent-1", LockSettings::default());
        assert!(locks.acquire("src/lib.rs", Duration::ZERO, false));

        let mut lifecycle = AgentLifecycle::start(
            registry.clone(),
            "agent-1",
            "test-engineer",
            Some("WP-1"),
            BTreeMap::new(),
        )
        .unwrap()
        .with_lock_manager(locks.clone());
        assert!(registry.get_agent("agent-1").is_some());

        let result = lifecycle.shutdown().unwrap();
        assert_eq!(result.agents_deregistered, 1);
        assert_eq!(result.locks_released, 1);
        assert!(registry.get_agent("agent-1").is_none());
        assert!(!locks.is_locked("src/lib.rs"));
        assert!(lifecycle.shutdown_state().is_cleanup_complete());

        // Second shutdown has nothing left to do
        assert_eq!(lifecycle.shutdown().unwrap(), ShutdownResult::new());
    }

    #[test]
    fn test_drop_deregisters() {
        let (_, registry) = setup();
        {
            let _lifecycle =
                AgentLifecycle::start(registry.clone(), "agent-1", "general-purpose", None, BTreeMap::new()).unwrap();
            assert_eq!(registry.list_active_agents().len(), 1);
        }
        assert!(registry.list_active_agents().is_empty());
    }

    #[test]
    fn test_panic_unwinding_deregisters() {
        let (_, registry) = setup();
        let inner = registry.clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _lifecycle =
                AgentLifecycle::start(inner, "agent-1", "general-purpose", None, BTreeMap::new()).unwrap();
            panic!("agent crashed");
        }));
        assert!(outcome.is_err());
        assert!(registry.get_agent("agent-1").is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_task_refreshes_record() {
        let (_, registry) = setup();
        let mut lifecycle =
            AgentLifecycle::start(registry.clone(), "agent-1", "general-purpose", None, BTreeMap::new()).unwrap();
        let registered_at = registry.get_agent("agent-1").unwrap().last_heartbeat;

        assert!(lifecycle.spawn_heartbeat(Duration::from_millis(10)));
        assert!(!lifecycle.spawn_heartbeat(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(60)).await;

        let last = registry.get_agent("agent-1").unwrap().last_heartbeat;
        assert!(last > registered_at);

        lifecycle.shutdown().unwrap();
        assert!(registry.get_agent("agent-1").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_releases_agent() {
        let (_, registry) = setup();
        let lifecycle =
            AgentLifecycle::start(registry.clone(), "agent-sig", "general-purpose", None, BTreeMap::new()).unwrap();
        lifecycle.install_signal_handlers().unwrap();

        signal_hook::low_level::raise(signal_hook::consts::SIGHUP).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !lifecycle.shutdown_state().is_shutdown_requested() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(lifecycle.shutdown_state().is_shutdown_requested());
        assert!(!lifecycle.is_registered());
        assert!(registry.get_agent("agent-sig").is_none());
    }

    #[test]
    fn test_heartbeat_requires_runtime() {
        let (_, registry) = setup();
        let mut lifecycle =
            AgentLifecycle::start(registry, "agent-1", "general-purpose", None, BTreeMap::new()).unwrap();
        assert!(!lifecycle.spawn_heartbeat(Duration::from_secs(1)));
    }
}
