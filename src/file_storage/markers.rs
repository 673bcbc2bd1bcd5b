//! Durable marker records
//!
//! A marker is one small record addressed by `(namespace, key)`. All
//! coordination state goes through the [`MarkerStore`] trait so the lock,
//! registry, and message contracts stay identical across backends:
//! - [`FsMarkerStore`] - local filesystem, for agents sharing one host
//! - [`MemoryMarkerStore`] - in-process, for tests and single-process embedding

use super::{ensure_dir, unique_temp_path, FileResult};
use crate::utils::lock_mutex_recover;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Extension of marker files on disk
const MARKER_EXTENSION: &str = "json";

/// Advisory lock file serializing compare-and-remove within a namespace
const GUARD_FILE: &str = ".guard";

/// Storage backend for durable coordination records.
///
/// Every mutation is atomic for a single record. Namespaces are `/`-separated
/// paths (`messages/agent-1`); keys may contain any characters.
pub trait MarkerStore: Send + Sync {
    /// Create the record only if no record exists under this key.
    /// Returns `false` when another writer already holds the key.
    fn create_if_absent(&self, namespace: &str, key: &str, content: &[u8]) -> FileResult<bool>;

    /// Create or overwrite the record
    fn replace(&self, namespace: &str, key: &str, content: &[u8]) -> FileResult<()>;

    /// Read a record, `None` if absent
    fn read(&self, namespace: &str, key: &str) -> FileResult<Option<Vec<u8>>>;

    /// Remove a record. Returns `true` only for the caller that removed it.
    fn remove(&self, namespace: &str, key: &str) -> FileResult<bool>;

    /// Remove a record only if its content still equals `expected`
    fn remove_if_matches(&self, namespace: &str, key: &str, expected: &[u8]) -> FileResult<bool>;

    /// Overwrite a record only if its content still equals `expected`
    fn replace_if_matches(
        &self,
        namespace: &str,
        key: &str,
        expected: &[u8],
        content: &[u8],
    ) -> FileResult<bool>;

    /// List keys in a namespace, sorted ascending
    fn list(&self, namespace: &str) -> FileResult<Vec<String>>;
}

/// Escape a key so it is a safe, flat file name
fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{:02X}", byte));
        }
    }
    escaped
}

/// Reverse [`escape_key`]
fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn validate_key(key: &str) -> FileResult<()> {
    if key.is_empty() {
        return Err("Marker key cannot be empty".to_string());
    }
    Ok(())
}

/// Filesystem-backed marker store rooted at one directory
#[derive(Debug, Clone)]
pub struct FsMarkerStore {
    root: PathBuf,
}

impl FsMarkerStore {
    /// Create a store rooted at `root` (created lazily on first write)
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        namespace
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |dir, segment| dir.join(escape_key(segment)))
    }

    fn marker_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{}.{}", escape_key(key), MARKER_EXTENSION))
    }

    /// Run `f` while holding the namespace's exclusive guard lock
    fn with_guard<T>(&self, dir: &Path, f: impl FnOnce() -> FileResult<T>) -> FileResult<T> {
        ensure_dir(dir)?;
        let guard = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(GUARD_FILE))
            .map_err(|e| format!("Failed to open guard file in {:?}: {}", dir, e))?;
        guard
            .lock_exclusive()
            .map_err(|e| format!("Failed to lock guard file in {:?}: {}", dir, e))?;

        let result = f();

        if let Err(e) = FileExt::unlock(&guard) {
            log::warn!("Failed to unlock guard file in {:?}: {}", dir, e);
        }
        result
    }

    /// Exclusive create without hard links (fallback for filesystems lacking them)
    fn create_new_in_place(path: &Path, content: &[u8]) -> FileResult<bool> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(content)
                    .map_err(|e| format!("Failed to write marker {:?}: {}", path, e))?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(format!("Failed to create marker {:?}: {}", path, e)),
        }
    }
}

impl MarkerStore for FsMarkerStore {
    fn create_if_absent(&self, namespace: &str, key: &str, content: &[u8]) -> FileResult<bool> {
        validate_key(key)?;
        let path = self.marker_path(namespace, key);
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }

        // Link a fully written temp file into place so readers never see a
        // partially written marker
        let temp_path = unique_temp_path(&path);
        fs::write(&temp_path, content)
            .map_err(|e| format!("Failed to write temp file {:?}: {}", temp_path, e))?;

        let result = match fs::hard_link(&temp_path, &path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => {
                log::debug!("Hard link unavailable for {:?} ({}), using create_new", path, e);
                Self::create_new_in_place(&path, content)
            }
        };

        let _ = fs::remove_file(&temp_path);
        result
    }

    fn replace(&self, namespace: &str, key: &str, content: &[u8]) -> FileResult<()> {
        validate_key(key)?;
        super::atomic_write(&self.marker_path(namespace, key), content)
    }

    fn read(&self, namespace: &str, key: &str) -> FileResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let path = self.marker_path(namespace, key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(format!("Failed to read marker {:?}: {}", path, e)),
        }
    }

    fn remove(&self, namespace: &str, key: &str) -> FileResult<bool> {
        validate_key(key)?;
        let dir = self.namespace_dir(namespace);
        if !dir.exists() {
            return Ok(false);
        }
        let path = self.marker_path(namespace, key);
        self.with_guard(&dir, || match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(format!("Failed to remove marker {:?}: {}", path, e)),
        })
    }

    fn remove_if_matches(&self, namespace: &str, key: &str, expected: &[u8]) -> FileResult<bool> {
        validate_key(key)?;
        let dir = self.namespace_dir(namespace);
        if !dir.exists() {
            return Ok(false);
        }
        let path = self.marker_path(namespace, key);
        self.with_guard(&dir, || {
            let current = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(format!("Failed to read marker {:?}: {}", path, e)),
            };
            if current != expected {
                return Ok(false);
            }
            match fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(format!("Failed to remove marker {:?}: {}", path, e)),
            }
        })
    }

    fn replace_if_matches(
        &self,
        namespace: &str,
        key: &str,
        expected: &[u8],
        content: &[u8],
    ) -> FileResult<bool> {
        validate_key(key)?;
        let dir = self.namespace_dir(namespace);
        if !dir.exists() {
            return Ok(false);
        }
        let path = self.marker_path(namespace, key);
        self.with_guard(&dir, || {
            match fs::read(&path) {
                Ok(current) if current == expected => {}
                Ok(_) => return Ok(false),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(format!("Failed to read marker {:?}: {}", path, e)),
            }
            super::atomic_write(&path, content)?;
            Ok(true)
        })
    }

    fn list(&self, namespace: &str) -> FileResult<Vec<String>> {
        let dir = self.namespace_dir(namespace);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries =
            fs::read_dir(&dir).map_err(|e| format!("Failed to read directory {:?}: {}", dir, e))?;

        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(MARKER_EXTENSION) {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.starts_with('.'))
                .and_then(unescape_key)
            {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// In-process marker store with the same contracts as [`FsMarkerStore`]
#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    records: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn record_id(namespace: &str, key: &str) -> (String, String) {
    (namespace.trim_matches('/').to_string(), key.to_string())
}

impl MarkerStore for MemoryMarkerStore {
    fn create_if_absent(&self, namespace: &str, key: &str, content: &[u8]) -> FileResult<bool> {
        validate_key(key)?;
        let mut records = lock_mutex_recover(&self.records);
        let id = record_id(namespace, key);
        if records.contains_key(&id) {
            return Ok(false);
        }
        records.insert(id, content.to_vec());
        Ok(true)
    }

    fn replace(&self, namespace: &str, key: &str, content: &[u8]) -> FileResult<()> {
        validate_key(key)?;
        let mut records = lock_mutex_recover(&self.records);
        records.insert(record_id(namespace, key), content.to_vec());
        Ok(())
    }

    fn read(&self, namespace: &str, key: &str) -> FileResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let records = lock_mutex_recover(&self.records);
        Ok(records.get(&record_id(namespace, key)).cloned())
    }

    fn remove(&self, namespace: &str, key: &str) -> FileResult<bool> {
        validate_key(key)?;
        let mut records = lock_mutex_recover(&self.records);
        Ok(records.remove(&record_id(namespace, key)).is_some())
    }

    fn remove_if_matches(&self, namespace: &str, key: &str, expected: &[u8]) -> FileResult<bool> {
        validate_key(key)?;
        let mut records = lock_mutex_recover(&self.records);
        let id = record_id(namespace, key);
        if records.get(&id).map(|c| c.as_slice()) == Some(expected) {
            records.remove(&id);
            return Ok(true);
        }
        Ok(false)
    }

    fn replace_if_matches(
        &self,
        namespace: &str,
        key: &str,
        expected: &[u8],
        content: &[u8],
    ) -> FileResult<bool> {
        validate_key(key)?;
        let mut records = lock_mutex_recover(&self.records);
        match records.get_mut(&record_id(namespace, key)) {
            Some(current) if current.as_slice() == expected => {
                *current = content.to_vec();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list(&self, namespace: &str) -> FileResult<Vec<String>> {
        let records = lock_mutex_recover(&self.records);
        let namespace = namespace.trim_matches('/');
        Ok(records
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn check_contracts(store: &dyn MarkerStore) {
        assert!(store.create_if_absent("locks", "src/main.rs", b"one").unwrap());
        assert!(!store.create_if_absent("locks", "src/main.rs", b"two").unwrap());
        assert_eq!(
            store.read("locks", "src/main.rs").unwrap(),
            Some(b"one".to_vec())
        );

        assert!(!store.remove_if_matches("locks", "src/main.rs", b"two").unwrap());
        assert!(store.remove_if_matches("locks", "src/main.rs", b"one").unwrap());
        assert_eq!(store.read("locks", "src/main.rs").unwrap(), None);

        store.replace("locks", "shared", b"v1").unwrap();
        assert!(!store.replace_if_matches("locks", "shared", b"v0", b"v2").unwrap());
        assert!(store.replace_if_matches("locks", "shared", b"v1", b"v2").unwrap());
        assert_eq!(store.read("locks", "shared").unwrap(), Some(b"v2".to_vec()));
        assert!(store.remove("locks", "shared").unwrap());
        assert!(!store.replace_if_matches("locks", "shared", b"v2", b"v3").unwrap());

        store.replace("agents", "a1", b"x").unwrap();
        store.replace("agents", "a1", b"y").unwrap();
        assert_eq!(store.read("agents", "a1").unwrap(), Some(b"y".to_vec()));

        store.replace("agents", "b2", b"z").unwrap();
        assert_eq!(store.list("agents").unwrap(), vec!["a1", "b2"]);
        assert!(store.list("nothing-here").unwrap().is_empty());

        assert!(store.remove("agents", "a1").unwrap());
        assert!(!store.remove("agents", "a1").unwrap());
        assert!(store.create_if_absent("", "", b"").is_err());
    }

    #[test]
    fn test_fs_store_contracts() {
        let temp_dir = TempDir::new().unwrap();
        check_contracts(&FsMarkerStore::new(temp_dir.path()));
    }

    #[test]
    fn test_memory_store_contracts() {
        check_contracts(&MemoryMarkerStore::new());
    }

    #[test]
    fn test_escape_round_trip() {
        for key in ["plain", "src/lib.rs", "with space", "ünïcode", "100%"] {
            let escaped = escape_key(key);
            assert!(escaped
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'%'));
            assert_eq!(unescape_key(&escaped).as_deref(), Some(key));
        }
    }

    #[test]
    fn test_nested_namespaces_are_isolated() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsMarkerStore::new(temp_dir.path());

        store.replace("messages/agent-1", "m1", b"{}").unwrap();
        store.replace("messages/agent-2", "m2", b"{}").unwrap();

        assert_eq!(store.list("messages/agent-1").unwrap(), vec!["m1"]);
        assert_eq!(store.list("messages/agent-2").unwrap(), vec!["m2"]);
        assert!(store.list("messages").unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_create_has_single_winner() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let root = root.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let store = FsMarkerStore::new(&root);
                    barrier.wait();
                    store
                        .create_if_absent("locks", "shared", format!("{}", i).as_bytes())
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
