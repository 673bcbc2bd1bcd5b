// Agent registry: durable records of live agents and their heartbeats

use super::messages::purge_mailbox;
use crate::file_storage::{decode_record, encode_record, is_readable_version, MarkerStore, RECORD_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const AGENTS_NAMESPACE: &str = "agents";

/// Registry record for one live agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    #[serde(default)]
    pub version: u32,
    pub agent_id: String,
    pub agent_type: String,
    #[serde(default)]
    pub work_package_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub pid: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl AgentInfo {
    /// Time since the last heartbeat, zero if the clock went backwards
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Reads and writes agent records in the shared store
#[derive(Clone)]
pub struct AgentRegistry {
    store: Arc<dyn MarkerStore>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn MarkerStore>) -> Self {
        Self { store }
    }

    /// Register or re-register an agent. Re-registration replaces metadata
    /// and resets both timestamps.
    pub fn register(
        &self,
        agent_id: &str,
        agent_type: &str,
        work_package_id: Option<&str>,
        metadata: BTreeMap<String, Value>,
    ) -> bool {
        let now = Utc::now();
        let info = AgentInfo {
            version: RECORD_VERSION,
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            work_package_id: work_package_id.map(str::to_string),
            registered_at: now,
            last_heartbeat: now,
            pid: std::process::id(),
            metadata,
        };

        let result = encode_record(&info)
            .and_then(|content| self.store.replace(AGENTS_NAMESPACE, agent_id, &content));
        match result {
            Ok(()) => {
                log::info!("Registered agent {} ({})", agent_id, agent_type);
                true
            }
            Err(e) => {
                log::error!("Failed to register agent {}: {}", agent_id, e);
                false
            }
        }
    }

    /// Advance the agent's last-seen time. Unknown ids return `false`.
    pub fn heartbeat(&self, agent_id: &str) -> bool {
        let Some((info, bytes)) = self.read_record(agent_id) else {
            log::debug!("Heartbeat from unknown agent {}", agent_id);
            return false;
        };
        self.refresh(info, &bytes)
    }

    /// Write `info` with a fresh heartbeat if the stored record still equals `read`
    fn refresh(&self, mut info: AgentInfo, read: &[u8]) -> bool {
        info.last_heartbeat = Utc::now();

        let result = encode_record(&info).and_then(|content| {
            self.store
                .replace_if_matches(AGENTS_NAMESPACE, &info.agent_id, read, &content)
        });
        match result {
            Ok(true) => true,
            Ok(false) => {
                log::debug!("Agent {} changed or vanished during heartbeat", info.agent_id);
                false
            }
            Err(e) => {
                log::warn!("Failed to record heartbeat for {}: {}", info.agent_id, e);
                false
            }
        }
    }

    /// Remove the agent's record along with its subscriptions and
    /// undelivered messages; no-op if absent
    pub fn deregister(&self, agent_id: &str) -> bool {
        match self.store.remove(AGENTS_NAMESPACE, agent_id) {
            Ok(removed) => {
                if removed {
                    purge_mailbox(self.store.as_ref(), agent_id);
                    log::info!("Deregistered agent {}", agent_id);
                }
                removed
            }
            Err(e) => {
                log::warn!("Failed to deregister agent {}: {}", agent_id, e);
                false
            }
        }
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<AgentInfo> {
        self.read_record(agent_id).map(|(info, _)| info)
    }

    /// Snapshot of every readable agent record, sorted by id
    pub fn list_active_agents(&self) -> Vec<AgentInfo> {
        self.list_ids()
            .iter()
            .filter_map(|id| self.get_agent(id))
            .collect()
    }

    /// Remove agents whose heartbeat is older than `timeout` and return their ids.
    ///
    /// A record is only removed if it is unchanged since it was judged
    /// stale, so a heartbeat landing mid-sweep keeps the agent alive.
    /// Reaped agents lose their subscriptions and pending messages.
    pub fn cleanup_stale_agents(&self, timeout: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut reaped = Vec::new();

        for id in self.list_ids() {
            let Some((info, bytes)) = self.read_record(&id) else {
                continue;
            };
            if info.heartbeat_age(now) <= timeout {
                continue;
            }

            match self.store.remove_if_matches(AGENTS_NAMESPACE, &id, &bytes) {
                Ok(true) => {
                    log::warn!(
                        "Reaped stale agent {} (last heartbeat {})",
                        id,
                        info.last_heartbeat.to_rfc3339()
                    );
                    purge_mailbox(self.store.as_ref(), &id);
                    reaped.push(id);
                }
                Ok(false) => {}
                Err(e) => log::warn!("Failed to reap agent {}: {}", id, e),
            }
        }

        reaped
    }

    fn list_ids(&self) -> Vec<String> {
        self.store.list(AGENTS_NAMESPACE).unwrap_or_else(|e| {
            log::warn!("Failed to list agents: {}", e);
            Vec::new()
        })
    }

    fn read_record(&self, agent_id: &str) -> Option<(AgentInfo, Vec<u8>)> {
        let bytes = match self.store.read(AGENTS_NAMESPACE, agent_id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Failed to read agent {}: {}", agent_id, e);
                return None;
            }
        };

        match decode_record::<AgentInfo>(&bytes) {
            Ok(info) if is_readable_version(info.version) => Some((info, bytes)),
            Ok(info) => {
                log::debug!(
                    "Skipping agent {} written by newer record version {}",
                    agent_id,
                    info.version
                );
                None
            }
            Err(e) => {
                log::warn!("Skipping unreadable agent record {}: {}", agent_id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::messages::{Message, MessageQueue, SUBSCRIPTIONS_NAMESPACE};
    use crate::file_storage::{FsMarkerStore, MemoryMarkerStore};
    use serde_json::json;
    use tempfile::TempDir;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(MemoryMarkerStore::new()))
    }

    #[test]
    fn test_register_is_upsert() {
        let registry = registry();
        let mut metadata = BTreeMap::new();
        metadata.insert("branch".to_string(), json!("feature/a"));

        assert!(registry.register("agent-1", "test-engineer", Some("WP-1"), metadata));
        assert!(registry.register("agent-1", "code-reviewer", None, BTreeMap::new()));

        let info = registry.get_agent("agent-1").unwrap();
        assert_eq!(info.agent_type, "code-reviewer");
        assert_eq!(info.work_package_id, None);
        assert!(info.metadata.is_empty());
        assert_eq!(registry.list_active_agents().len(), 1);
    }

    #[test]
    fn test_heartbeat_unknown_agent_returns_false() {
        let registry = registry();
        assert!(!registry.heartbeat("ghost"));
        assert!(registry.get_agent("ghost").is_none());
    }

    #[test]
    fn test_heartbeat_advances_last_seen() {
        let registry = registry();
        registry.register("agent-1", "general-purpose", None, BTreeMap::new());
        let before = registry.get_agent("agent-1").unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert!(registry.heartbeat("agent-1"));

        let after = registry.get_agent("agent-1").unwrap();
        assert!(after.last_heartbeat > before.last_heartbeat);
        assert_eq!(after.registered_at, before.registered_at);
    }

    #[test]
    fn test_heartbeat_does_not_overwrite_newer_registration() {
        let registry = registry();
        registry.register("agent-1", "general-purpose", None, BTreeMap::new());
        let (snapshot, bytes) = registry.read_record("agent-1").unwrap();

        let mut metadata = BTreeMap::new();
        metadata.insert("branch".to_string(), json!("feature/b"));
        std::thread::sleep(Duration::from_millis(2));
        registry.register("agent-1", "test-engineer", Some("WP-2"), metadata);

        assert!(!registry.refresh(snapshot, &bytes));
        let info = registry.get_agent("agent-1").unwrap();
        assert_eq!(info.agent_type, "test-engineer");
        assert_eq!(info.metadata["branch"], json!("feature/b"));

        // A stale snapshot never recreates a removed record
        let (snapshot, bytes) = registry.read_record("agent-1").unwrap();
        registry.deregister("agent-1");
        assert!(!registry.refresh(snapshot, &bytes));
        assert!(registry.get_agent("agent-1").is_none());
    }

    #[test]
    fn test_reap_and_deregister_drop_mailbox() {
        let store: Arc<dyn MarkerStore> = Arc::new(MemoryMarkerStore::new());
        let registry = AgentRegistry::new(store.clone());
        let sender = MessageQueue::new(store.clone(), "agent-x", Duration::from_millis(10));
        for id in ["agent-dead", "agent-done"] {
            registry.register(id, "general-purpose", None, BTreeMap::new());
            MessageQueue::new(store.clone(), id, Duration::from_millis(10)).subscribe("status", |_| Ok(()));
        }
        sender.publish(Message::broadcast("agent-x", "status", json!("before")));

        let mut stale = registry.get_agent("agent-dead").unwrap();
        stale.last_heartbeat = Utc::now() - chrono::Duration::minutes(10);
        store
            .replace(AGENTS_NAMESPACE, "agent-dead", &encode_record(&stale).unwrap())
            .unwrap();
        assert_eq!(registry.cleanup_stale_agents(Duration::from_secs(60)), vec!["agent-dead"]);
        assert!(registry.deregister("agent-done"));

        sender.publish(Message::broadcast("agent-x", "status", json!("after")));
        assert!(store.list(SUBSCRIPTIONS_NAMESPACE).unwrap().is_empty());
        assert!(store.list("messages/agent-dead").unwrap().is_empty());
        assert!(store.list("messages/agent-done").unwrap().is_empty());
    }

    #[test]
    fn test_deregister_is_noop_when_absent() {
        let registry = registry();
        registry.register("agent-1", "general-purpose", None, BTreeMap::new());
        assert!(registry.deregister("agent-1"));
        assert!(!registry.deregister("agent-1"));
        assert!(!registry.heartbeat("agent-1"));
    }

    #[test]
    fn test_records_survive_a_new_registry_instance() {
        let temp_dir = TempDir::new().unwrap();
        let first = AgentRegistry::new(Arc::new(FsMarkerStore::new(temp_dir.path())));
        first.register("agent-b", "test-engineer", Some("WP-2"), BTreeMap::new());
        first.register("agent-a", "general-purpose", Some("WP-1"), BTreeMap::new());

        let second = AgentRegistry::new(Arc::new(FsMarkerStore::new(temp_dir.path())));
        let ids: Vec<String> = second
            .list_active_agents()
            .into_iter()
            .map(|a| a.agent_id)
            .collect();
        assert_eq!(ids, vec!["agent-a", "agent-b"]);
    }

    #[test]
    fn test_newer_record_versions_are_skipped() {
        let store: Arc<dyn MarkerStore> = Arc::new(MemoryMarkerStore::new());
        let registry = AgentRegistry::new(store.clone());
        registry.register("agent-1", "general-purpose", None, BTreeMap::new());

        let mut future = registry.get_agent("agent-1").unwrap();
        future.version = RECORD_VERSION + 1;
        store
            .replace(AGENTS_NAMESPACE, "agent-2", &serde_json::to_vec(&future).unwrap())
            .unwrap();

        assert_eq!(registry.list_active_agents().len(), 1);
        assert!(registry.get_agent("agent-2").is_none());
    }
}
