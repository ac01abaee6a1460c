//! Store Snapshots
//!
//! Saves the complete in-memory store as pretty JSON and restores it later,
//! so waiting process instances and pending jobs survive a restart of the
//! CLI.
//!
//! Snapshots default to `.procrunner/{name}.state.json` in the current
//! directory.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use super::memory::{MemoryStore, StoreData};
use super::StoreError;

/// Directory used for snapshots when no explicit path is given.
pub const SNAPSHOT_DIR: &str = ".procrunner";

/// Default snapshot path for a process file.
pub fn default_snapshot_path(process_path: &str) -> PathBuf {
    let stem = Path::new(process_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("process");

    Path::new(SNAPSHOT_DIR).join(format!("{}.state.json", stem))
}

impl MemoryStore {
    /// Writes the whole store to `path`, creating parent directories.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let json = {
            let data = self.lock();
            serde_json::to_string_pretty(&*data)?
        };
        fs::write(path, json)?;

        info!("Saved engine state to {}", path.display());
        Ok(())
    }

    /// Restores a store from a snapshot file.
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let data: StoreData = serde_json::from_str(&content)?;

        info!(
            "Loaded engine state from {} ({} executions, {} jobs)",
            path.display(),
            data.executions.len(),
            data.jobs.len()
        );
        Ok(Self::from_data(data))
    }

    /// Loads the snapshot when the file exists, otherwise starts empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_snapshot(path)
        } else {
            info!("No state at {} - starting with an empty store", path.display());
            Ok(Self::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Execution;
    use crate::store::{ChangeSet, ProcessStore};
    use tempfile::tempdir;

    #[test]
    fn test_default_snapshot_path() {
        assert_eq!(
            default_snapshot_path("flows/order.yaml"),
            Path::new(".procrunner").join("order.state.json")
        );
        assert_eq!(
            default_snapshot_path(""),
            Path::new(".procrunner").join("process.state.json")
        );
    }

    #[test]
    fn test_snapshot_preserves_records_and_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = MemoryStore::new();
        let id = store.next_id();
        let mut changes = ChangeSet::default();
        changes.executions.inserted.push(Execution::new_root(id.clone(), "p", Some("order-1".to_string())));
        store.commit(changes).unwrap();
        store.save_snapshot(&path).unwrap();

        let restored = MemoryStore::load_snapshot(&path).unwrap();
        let root = restored.find_execution(&id).unwrap().unwrap();
        assert_eq!(root.business_key.as_deref(), Some("order-1"));
        assert_eq!(root.revision, 1);
        assert_eq!(restored.next_id(), "2");
    }

    #[test]
    fn test_open_missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::open(dir.path().join("absent.json")).unwrap();
        assert_eq!(store.execution_count(), 0);
    }

    #[test]
    fn test_corrupt_snapshot_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            MemoryStore::load_snapshot(&path),
            Err(StoreError::Serialization(_))
        ));
    }
}
