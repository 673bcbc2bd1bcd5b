//! Disk-backed coordination primitives shared by cooperating agent processes
//!
//! Every service persists through a [`MarkerStore`](crate::file_storage::MarkerStore)
//! and reports failures as `bool`/`Option`/empty results, so a crashed or
//! misbehaving collaborator cannot wedge the caller.

pub mod conflicts;
pub mod lifecycle;
pub mod lock;
pub mod messages;
pub mod registry;
pub mod resources;

pub use conflicts::{
    Conflict, ConflictDetails, ConflictResolution, ConflictResolver, ConflictType, LineRange,
    QueuedOperation, ResolutionStrategy,
};
pub use lifecycle::AgentLifecycle;
pub use lock::{LockGuard, LockInfo, LockManager, LockSettings};
pub use messages::{Message, MessageHandler, MessagePriority, MessageQueue, BROADCAST};
pub use registry::{AgentInfo, AgentRegistry};
pub use resources::{ResourceKind, ResourceLimits, ResourceMonitor, ResourceUsage, UsageReport, UsageSummary};
