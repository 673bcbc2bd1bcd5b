//! File-based storage for coordination state
//!
//! Every coordination primitive persists its records under one storage root
//! shared by all cooperating processes:
//! - `locks/` - Lock markers keyed by resource name
//! - `agents/` - Registry records keyed by agent id
//! - `messages/{recipient}/` - Message records partitioned by recipient
//! - `subscriptions/` - Message type subscriptions per agent
//! - `resources/` - Latest usage report per agent
//! - `throttle/` - Advisory throttle records per agent
//! - `queued/{agent}/` - Operations deferred by the conflict resolver
//!
//! Records are JSON and are only ever mutated through [`MarkerStore`] so each
//! write is atomic at the granularity of one record.

pub mod markers;

pub use markers::{FsMarkerStore, MarkerStore, MemoryMarkerStore};

use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Common file operations result type
pub type FileResult<T> = Result<T, String>;

/// Version of the record formats written by this build.
///
/// Readers accept records up to this version and skip anything newer.
pub const RECORD_VERSION: u32 = 1;

/// Get the default storage root for a project
pub fn get_fleet_dir(project_path: &Path) -> PathBuf {
    project_path.join(".fleet")
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> FileResult<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| format!("Failed to create directory {:?}: {}", path, e))?;
    }
    Ok(())
}

/// Build a temp path next to `path` that no other writer will pick
pub(crate) fn unique_temp_path(path: &Path) -> PathBuf {
    let name = format!(".{}.tmp", Uuid::new_v4().simple());
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Write data to a file atomically (temp file + rename)
pub fn atomic_write(path: &Path, content: &[u8]) -> FileResult<()> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let temp_path = unique_temp_path(path);
    fs::write(&temp_path, content)
        .map_err(|e| format!("Failed to write temp file {:?}: {}", temp_path, e))?;

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(format!(
            "Failed to rename {:?} to {:?}: {}",
            temp_path, path, e
        ));
    }

    Ok(())
}

/// Read a JSON file and deserialize it
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> FileResult<T> {
    let content =
        fs::read(path).map_err(|e| format!("Failed to read file {:?}: {}", path, e))?;

    serde_json::from_slice(&content)
        .map_err(|e| format!("Failed to parse JSON from {:?}: {}", path, e))
}

/// Serialize a record for a [`MarkerStore`]
pub fn encode_record<T: serde::Serialize>(record: &T) -> FileResult<Vec<u8>> {
    serde_json::to_vec_pretty(record).map_err(|e| format!("Failed to serialize record: {}", e))
}

/// Deserialize a record read from a [`MarkerStore`]
pub fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> FileResult<T> {
    serde_json::from_slice(bytes).map_err(|e| format!("Failed to parse record: {}", e))
}

/// Whether a record written with `version` can be read by this build
pub fn is_readable_version(version: u32) -> bool {
    version <= RECORD_VERSION
}

/// Initialize the storage root with a .gitignore for runtime files
pub fn init_fleet_dir(root: &Path) -> FileResult<PathBuf> {
    ensure_dir(root)?;

    let gitignore_path = root.join(".gitignore");
    if !gitignore_path.exists() {
        let gitignore_content = r#"# Runtime coordination state (not for sharing)
*.tmp
locks/
agents/
messages/
subscriptions/
resources/
throttle/
queued/
"#;
        fs::write(&gitignore_path, gitignore_content)
            .map_err(|e| format!("Failed to write .gitignore: {}", e))?;
    }

    Ok(root.to_path_buf())
}
