//! Deterministic arbitration between two agents contending for one resource
//!
//! The resolver only decides and records intent. Queued operations are
//! stored per agent under `queued/{agent_id}` for the caller to replay.

use crate::file_storage::{decode_record, encode_record, is_readable_version, MarkerStore, RECORD_VERSION};
use crate::utils::{generate_id, stamp_key, MonotonicStamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const QUEUED_NAMESPACE: &str = "queued";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    FileEdit,
    GitOperation,
    TaskAssignment,
    ResourceContention,
}

/// Inclusive range of line numbers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    pub fn overlaps(&self, other: &LineRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Context for a conflict. Missing ranges or versions are treated
/// conservatively: unknown ranges overlap, unknown versions never diverge.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetails {
    #[serde(default)]
    pub first_range: Option<LineRange>,
    #[serde(default)]
    pub second_range: Option<LineRange>,
    /// Last version of the resource each agent saw
    #[serde(default)]
    pub first_version: Option<String>,
    #[serde(default)]
    pub second_version: Option<String>,
    /// Operation the second agent wants to run, kept for replay
    #[serde(default)]
    pub pending_operation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub conflict_type: ConflictType,
    pub resource_id: String,
    /// Agent that got there first
    pub first_agent: String,
    pub second_agent: String,
    #[serde(default)]
    pub details: ConflictDetails,
}

impl Conflict {
    pub fn new(
        conflict_type: ConflictType,
        resource_id: impl Into<String>,
        first_agent: impl Into<String>,
        second_agent: impl Into<String>,
    ) -> Self {
        Self {
            conflict_type,
            resource_id: resource_id.into(),
            first_agent: first_agent.into(),
            second_agent: second_agent.into(),
            details: ConflictDetails::default(),
        }
    }

    pub fn with_details(mut self, details: ConflictDetails) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    /// Both changes apply
    Merge,
    /// The second agent's operation is deferred for replay
    Queue,
    /// The first agent keeps the resource; the second drops its claim
    FirstWins,
    /// The second agent must abandon its operation
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    /// Agent allowed to proceed; `None` when both proceed
    pub winner: Option<String>,
    pub reason: String,
    /// Set when a queued operation was recorded
    pub queued_operation_id: Option<String>,
}

/// Deferred operation awaiting replay by its agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    #[serde(default)]
    pub version: u32,
    pub id: String,
    pub agent_id: String,
    pub conflict_type: ConflictType,
    pub resource_id: String,
    #[serde(default)]
    pub operation: Option<String>,
    /// Agent whose operation goes first
    pub blocked_by: String,
    pub queued_at: DateTime<Utc>,
}

/// Pure policy table: strategy and explanation for `conflict`
pub fn decide(conflict: &Conflict) -> (ResolutionStrategy, String) {
    match conflict.conflict_type {
        ConflictType::FileEdit => decide_file_edit(&conflict.details),
        ConflictType::GitOperation => (
            ResolutionStrategy::Queue,
            "Git operations are serialized, never merged".to_string(),
        ),
        ConflictType::TaskAssignment => (
            ResolutionStrategy::FirstWins,
            "Task already claimed by the first agent".to_string(),
        ),
        ConflictType::ResourceContention => (
            ResolutionStrategy::Queue,
            "Resource busy; waiting for the first agent".to_string(),
        ),
    }
}

fn decide_file_edit(details: &ConflictDetails) -> (ResolutionStrategy, String) {
    if let (Some(first), Some(second)) = (details.first_range, details.second_range) {
        if !first.overlaps(&second) {
            return (
                ResolutionStrategy::Merge,
                format!(
                    "Edits touch disjoint lines ({}-{} and {}-{})",
                    first.start, first.end, second.start, second.end
                ),
            );
        }
    }

    match (&details.first_version, &details.second_version) {
        (Some(first), Some(second)) if first != second => (
            ResolutionStrategy::Abort,
            format!(
                "Overlapping edits based on divergent versions ({} vs {})",
                first, second
            ),
        ),
        _ => (
            ResolutionStrategy::Queue,
            "Overlapping edits on the same version; replaying the second".to_string(),
        ),
    }
}

/// Applies [`decide`] and records queued operations
pub struct ConflictResolver {
    store: Arc<dyn MarkerStore>,
    stamp: MonotonicStamp,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn MarkerStore>) -> Self {
        Self {
            store,
            stamp: MonotonicStamp::new(),
        }
    }

    pub fn resolve(&self, conflict: &Conflict) -> ConflictResolution {
        let (strategy, reason) = decide(conflict);
        log::info!(
            "{:?} conflict on {} between {} and {}: {:?} ({})",
            conflict.conflict_type,
            conflict.resource_id,
            conflict.first_agent,
            conflict.second_agent,
            strategy,
            reason
        );

        let winner = match strategy {
            ResolutionStrategy::Merge => None,
            _ => Some(conflict.first_agent.clone()),
        };
        let queued_operation_id = match strategy {
            ResolutionStrategy::Queue => self.queue_operation(conflict),
            _ => None,
        };

        ConflictResolution {
            strategy,
            winner,
            reason,
            queued_operation_id,
        }
    }

    fn queue_operation(&self, conflict: &Conflict) -> Option<String> {
        let operation = QueuedOperation {
            version: RECORD_VERSION,
            id: generate_id(),
            agent_id: conflict.second_agent.clone(),
            conflict_type: conflict.conflict_type,
            resource_id: conflict.resource_id.clone(),
            operation: conflict.details.pending_operation.clone(),
            blocked_by: conflict.first_agent.clone(),
            queued_at: Utc::now(),
        };

        let namespace = format!("{}/{}", QUEUED_NAMESPACE, operation.agent_id);
        let key = format!("{}-{}", stamp_key(self.stamp.next()), operation.id);
        let result = encode_record(&operation)
            .and_then(|content| self.store.create_if_absent(&namespace, &key, &content));

        match result {
            Ok(true) => Some(operation.id),
            Ok(false) => {
                log::warn!("Queued operation key {} already taken", key);
                None
            }
            Err(e) => {
                log::warn!("Failed to queue operation for {}: {}", operation.agent_id, e);
                None
            }
        }
    }

    /// Operations queued for `agent_id`, oldest first
    pub fn get_queued_operations(&self, agent_id: &str) -> Vec<QueuedOperation> {
        let namespace = format!("{}/{}", QUEUED_NAMESPACE, agent_id);
        let keys = self.store.list(&namespace).unwrap_or_else(|e| {
            log::warn!("Failed to list queued operations for {}: {}", agent_id, e);
            Vec::new()
        });

        keys.iter()
            .filter_map(|key| match self.store.read(&namespace, key) {
                Ok(Some(bytes)) => decode_record::<QueuedOperation>(&bytes).ok(),
                _ => None,
            })
            .filter(|op| is_readable_version(op.version))
            .collect()
    }

    /// Remove every queued operation for `agent_id`, returning how many
    pub fn clear_queued_operations(&self, agent_id: &str) -> usize {
        let namespace = format!("{}/{}", QUEUED_NAMESPACE, agent_id);
        let keys = self.store.list(&namespace).unwrap_or_default();

        keys.iter()
            .filter(|key| self.store.remove(&namespace, key).unwrap_or(false))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_storage::MemoryMarkerStore;

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(Arc::new(MemoryMarkerStore::new()))
    }

    fn file_edit(first: Option<LineRange>, second: Option<LineRange>, versions: (Option<&str>, Option<&str>)) -> Conflict {
        Conflict::new(ConflictType::FileEdit, "src/lib.rs", "agent-1", "agent-2").with_details(ConflictDetails {
            first_range: first,
            second_range: second,
            first_version: versions.0.map(str::to_string),
            second_version: versions.1.map(str::to_string),
            pending_operation: Some("apply patch 42".to_string()),
        })
    }

    #[test]
    fn test_line_range_overlap_is_inclusive() {
        assert!(LineRange::new(1, 10).overlaps(&LineRange::new(10, 20)));
        assert!(!LineRange::new(1, 9).overlaps(&LineRange::new(10, 20)));
        assert_eq!(LineRange::new(9, 3), LineRange { start: 3, end: 9 });
    }

    #[test]
    fn test_file_edit_policy() {
        let disjoint = file_edit(Some(LineRange::new(1, 10)), Some(LineRange::new(20, 30)), (Some("a"), Some("b")));
        assert_eq!(decide(&disjoint).0, ResolutionStrategy::Merge);

        let same_version = file_edit(Some(LineRange::new(1, 10)), Some(LineRange::new(5, 15)), (Some("a"), Some("a")));
        assert_eq!(decide(&same_version).0, ResolutionStrategy::Queue);

        let divergent = file_edit(Some(LineRange::new(1, 10)), Some(LineRange::new(5, 15)), (Some("a"), Some("b")));
        assert_eq!(decide(&divergent).0, ResolutionStrategy::Abort);

        let unknown_ranges = file_edit(None, Some(LineRange::new(5, 15)), (None, None));
        assert_eq!(decide(&unknown_ranges).0, ResolutionStrategy::Queue);
    }

    #[test]
    fn test_other_conflict_types() {
        let git = Conflict::new(ConflictType::GitOperation, "repo", "agent-1", "agent-2");
        let task = Conflict::new(ConflictType::TaskAssignment, "WP-1", "agent-1", "agent-2");
        let contention = Conflict::new(ConflictType::ResourceContention, "gpu", "agent-1", "agent-2");

        assert_eq!(decide(&git).0, ResolutionStrategy::Queue);
        assert_eq!(decide(&task).0, ResolutionStrategy::FirstWins);
        assert_eq!(decide(&contention).0, ResolutionStrategy::Queue);
    }

    #[test]
    fn test_queue_records_operation_for_second_agent() {
        let resolver = resolver();
        let conflict = file_edit(Some(LineRange::new(1, 10)), Some(LineRange::new(5, 15)), (None, None));

        let resolution = resolver.resolve(&conflict);
        assert_eq!(resolution.strategy, ResolutionStrategy::Queue);
        assert_eq!(resolution.winner.as_deref(), Some("agent-1"));

        let queued = resolver.get_queued_operations("agent-2");
        assert_eq!(queued.len(), 1);
        assert_eq!(Some(&queued[0].id), resolution.queued_operation_id.as_ref());
        assert_eq!(queued[0].operation.as_deref(), Some("apply patch 42"));
        assert_eq!(queued[0].blocked_by, "agent-1");
        assert!(resolver.get_queued_operations("agent-1").is_empty());
    }

    #[test]
    fn test_non_queue_outcomes_record_nothing() {
        let resolver = resolver();
        let merge = resolver.resolve(&file_edit(
            Some(LineRange::new(1, 2)),
            Some(LineRange::new(3, 4)),
            (None, None),
        ));
        assert_eq!(merge.winner, None);
        assert_eq!(merge.queued_operation_id, None);

        let first_wins = resolver.resolve(&Conflict::new(ConflictType::TaskAssignment, "WP-1", "agent-1", "agent-2"));
        assert_eq!(first_wins.winner.as_deref(), Some("agent-1"));
        assert!(resolver.get_queued_operations("agent-2").is_empty());
    }

    #[test]
    fn test_queued_operations_are_fifo_and_clearable() {
        let resolver = resolver();
        for resource in ["repo-a", "repo-b", "repo-c"] {
            resolver.resolve(&Conflict::new(ConflictType::GitOperation, resource, "agent-1", "agent-2"));
        }

        let resources: Vec<String> = resolver
            .get_queued_operations("agent-2")
            .into_iter()
            .map(|op| op.resource_id)
            .collect();
        assert_eq!(resources, vec!["repo-a", "repo-b", "repo-c"]);

        assert_eq!(resolver.clear_queued_operations("agent-2"), 3);
        assert_eq!(resolver.clear_queued_operations("agent-2"), 0);
        assert!(resolver.get_queued_operations("agent-2").is_empty());
    }
}
