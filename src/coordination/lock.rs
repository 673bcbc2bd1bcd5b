//! Lease-based cross-process locks
//!
//! A lock is a marker in the `locks` namespace keyed by resource name. The
//! marker records its holder and lease; a marker older than its lease is
//! treated as abandoned and may be reclaimed by the next contender.

use crate::file_storage::{decode_record, encode_record, MarkerStore, RECORD_VERSION};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const LOCKS_NAMESPACE: &str = "locks";

/// Default lease in seconds
pub const DEFAULT_LEASE_SECS: u64 = 300;

pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Contents of a lock marker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    #[serde(default = "default_record_version")]
    pub version: u32,
    pub resource: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub lease_ms: u64,
    /// Process that wrote the marker
    pub pid: u32,
    /// Distinguishes successive acquisitions by the same holder
    pub token: String,
}

fn default_record_version() -> u32 {
    RECORD_VERSION
}

impl LockInfo {
    fn new(resource: &str, holder_id: &str, lease: Duration) -> Self {
        Self {
            version: RECORD_VERSION,
            resource: resource.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: Utc::now(),
            lease_ms: lease.as_millis().min(u64::MAX as u128) as u64,
            pid: std::process::id(),
            token: Uuid::new_v4().to_string(),
        }
    }

    /// Milliseconds since the lock was acquired (or last refreshed)
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.acquired_at).num_milliseconds()
    }

    /// Whether the lease has run out
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age_ms(now) > self.lease_ms as i64
    }
}

/// Timing knobs for a [`LockManager`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockSettings {
    pub lease: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Wait used by [`LockManager::lock_default`]
    pub acquire_timeout: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(DEFAULT_LEASE_SECS),
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

/// Acquires and releases locks on behalf of one holder
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn MarkerStore>,
    holder_id: String,
    settings: LockSettings,
}

impl LockManager {
    pub fn new(store: Arc<dyn MarkerStore>, holder_id: impl Into<String>, settings: LockSettings) -> Self {
        Self {
            store,
            holder_id: holder_id.into(),
            settings,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Try to take `resource`.
    ///
    /// Non-blocking calls make a single attempt. Blocking calls retry with
    /// jittered exponential backoff until `timeout` elapses.
    pub fn acquire(&self, resource: &str, timeout: Duration, blocking: bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut attempt: u32 = 0;

        loop {
            match self.try_acquire(resource) {
                Ok(true) => {
                    log::debug!("{} acquired lock on {}", self.holder_id, resource);
                    return true;
                }
                Ok(false) => {}
                Err(e) => log::warn!("Lock attempt on {} failed: {}", resource, e),
            }

            let now = Instant::now();
            if !blocking || now >= deadline {
                log::debug!(
                    "{} could not acquire lock on {} after {} attempts",
                    self.holder_id,
                    resource,
                    attempt + 1
                );
                return false;
            }

            std::thread::sleep(self.backoff(attempt).min(deadline - now));
            attempt = attempt.saturating_add(1);
        }
    }

    /// One acquisition attempt, reclaiming an expired marker if found
    fn try_acquire(&self, resource: &str) -> Result<bool, String> {
        let info = LockInfo::new(resource, &self.holder_id, self.settings.lease);
        let content = encode_record(&info)?;

        if self.store.create_if_absent(LOCKS_NAMESPACE, resource, &content)? {
            return Ok(true);
        }

        let existing = match self.store.read(LOCKS_NAMESPACE, resource)? {
            Some(bytes) => bytes,
            // Released between our create and read
            None => return self.store.create_if_absent(LOCKS_NAMESPACE, resource, &content),
        };

        let stale = match decode_record::<LockInfo>(&existing) {
            Ok(current) => {
                let expired = current.is_expired(Utc::now());
                if expired {
                    log::info!(
                        "Reclaiming abandoned lock on {} held by {} (lease {}ms)",
                        resource,
                        current.holder_id,
                        current.lease_ms
                    );
                }
                expired
            }
            Err(e) => {
                log::warn!("Unreadable lock marker on {}, reclaiming: {}", resource, e);
                true
            }
        };

        if !stale {
            return Ok(false);
        }

        // Only the contender that removes the exact stale marker gets to retry
        if self.store.remove_if_matches(LOCKS_NAMESPACE, resource, &existing)? {
            return self.store.create_if_absent(LOCKS_NAMESPACE, resource, &content);
        }
        Ok(false)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.base_backoff.as_millis() as u64;
        let max = self.settings.max_backoff.as_millis().max(1) as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(16)).clamp(1, max);
        let jittered = rand::thread_rng().gen_range(exp / 2..=exp);
        Duration::from_millis(jittered.max(1))
    }

    /// Release `resource` if this holder owns it.
    ///
    /// Releasing an absent lock or one owned by someone else is a no-op and
    /// returns `false`.
    pub fn release(&self, resource: &str) -> bool {
        let Some((info, bytes)) = self.read_marker(resource) else {
            return false;
        };

        if info.holder_id != self.holder_id {
            log::debug!(
                "{} tried to release lock on {} held by {}",
                self.holder_id,
                resource,
                info.holder_id
            );
            return false;
        }

        match self.store.remove_if_matches(LOCKS_NAMESPACE, resource, &bytes) {
            Ok(removed) => {
                if removed {
                    log::debug!("{} released lock on {}", self.holder_id, resource);
                }
                removed
            }
            Err(e) => {
                log::warn!("Failed to release lock on {}: {}", resource, e);
                false
            }
        }
    }

    /// Restart the lease of a lock this holder owns
    pub fn refresh(&self, resource: &str) -> bool {
        let Some((info, bytes)) = self.read_marker(resource) else {
            return false;
        };
        if info.holder_id != self.holder_id {
            return false;
        }

        let refreshed = LockInfo {
            acquired_at: Utc::now(),
            lease_ms: self.settings.lease.as_millis().min(u64::MAX as u128) as u64,
            ..info
        };
        let content = match encode_record(&refreshed) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("Failed to encode refreshed lock on {}: {}", resource, e);
                return false;
            }
        };

        self.store
            .replace_if_matches(LOCKS_NAMESPACE, resource, &bytes, &content)
            .unwrap_or_else(|e| {
                log::warn!("Failed to refresh lock on {}: {}", resource, e);
                false
            })
    }

    /// Release every lock this holder owns, returning how many were released
    pub fn release_all(&self) -> usize {
        self.list_locks()
            .into_iter()
            .filter(|info| info.holder_id == self.holder_id)
            .filter(|info| self.release(&info.resource))
            .count()
    }

    /// Blocking acquire that releases on drop
    pub fn lock(&self, resource: &str, timeout: Duration) -> Option<LockGuard<'_>> {
        if self.acquire(resource, timeout, true) {
            Some(LockGuard {
                manager: self,
                resource: resource.to_string(),
            })
        } else {
            None
        }
    }

    /// [`lock`](Self::lock) with the configured acquire timeout
    pub fn lock_default(&self, resource: &str) -> Option<LockGuard<'_>> {
        self.lock(resource, self.settings.acquire_timeout)
    }

    /// Run `f` while holding `resource`; `None` if the lock was not obtained
    pub fn with_lock<T>(&self, resource: &str, timeout: Duration, f: impl FnOnce() -> T) -> Option<T> {
        let _guard = self.lock(resource, timeout)?;
        Some(f())
    }

    /// Current holder of `resource`, if any
    pub fn lock_info(&self, resource: &str) -> Option<LockInfo> {
        self.read_marker(resource).map(|(info, _)| info)
    }

    pub fn is_locked(&self, resource: &str) -> bool {
        self.lock_info(resource)
            .map(|info| !info.is_expired(Utc::now()))
            .unwrap_or(false)
    }

    /// Every readable lock marker, sorted by resource name
    pub fn list_locks(&self) -> Vec<LockInfo> {
        let keys = match self.store.list(LOCKS_NAMESPACE) {
            Ok(keys) => keys,
            Err(e) => {
                log::warn!("Failed to list locks: {}", e);
                return Vec::new();
            }
        };
        keys.iter()
            .filter_map(|resource| self.lock_info(resource))
            .collect()
    }

    fn read_marker(&self, resource: &str) -> Option<(LockInfo, Vec<u8>)> {
        let bytes = match self.store.read(LOCKS_NAMESPACE, resource) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Failed to read lock on {}: {}", resource, e);
                return None;
            }
        };
        match decode_record::<LockInfo>(&bytes) {
            Ok(info) => Some((info, bytes)),
            Err(e) => {
                log::debug!("Skipping unreadable lock marker on {}: {}", resource, e);
                None
            }
        }
    }
}

/// Holds a lock until dropped
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    resource: String,
}

impl LockGuard<'_> {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Extend the lease while the critical section runs
    pub fn refresh(&self) -> bool {
        self.manager.refresh(&self.resource)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.manager.release(&self.resource) {
            log::warn!(
                "Lock on {} was no longer held by {} at release",
                self.resource,
                self.manager.holder_id
            );
        }
    }
}
