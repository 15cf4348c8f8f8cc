//! JSON snapshots of the memory store
//!
//! A snapshot is a JSON document holding every entry in its `to_dict` form,
//! ordered by id.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StageMemError};
use crate::memory::MemoryStore;
use crate::types::MemoryEntry;

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk snapshot document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub entries: Vec<serde_json::Value>,
}

impl Snapshot {
    pub fn capture(store: &MemoryStore) -> Result<Self> {
        let entries = store
            .snapshot()
            .iter()
            .map(MemoryEntry::to_dict)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            entries,
        })
    }

    pub fn into_entries(self) -> Result<Vec<MemoryEntry>> {
        if self.version != SNAPSHOT_VERSION {
            return Err(StageMemError::InvalidInput(format!(
                "unsupported snapshot version {}",
                self.version
            )));
        }
        self.entries.into_iter().map(MemoryEntry::from_dict).collect()
    }
}

fn expand(path: &str) -> String {
    shellexpand::tilde(path).to_string()
}

/// Write every entry of `store` to `path`; returns the number written
pub fn save(store: &MemoryStore, path: &str) -> Result<usize> {
    let path = expand(path);
    let snapshot = Snapshot::capture(store)?;
    let count = snapshot.entries.len();

    if let Some(parent) = Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(&snapshot)?;
    // replace atomically
    let tmp = format!("{}.tmp", path);
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &path)?;

    tracing::info!(path = %path, entries = count, "Snapshot saved");
    Ok(count)
}

/// Read the entries of a snapshot file without touching any store
pub fn read(path: &str) -> Result<Vec<MemoryEntry>> {
    let path = expand(path);
    let content = std::fs::read_to_string(&path)?;
    let snapshot: Snapshot = serde_json::from_str(&content)?;
    snapshot.into_entries()
}

/// Load a snapshot into `store`. All entries are added or none are.
pub fn load(store: &MemoryStore, path: &str) -> Result<usize> {
    let entries = read(path)?;
    let count = store.restore(entries)?;
    tracing::info!(path = %expand(path), entries = count, "Snapshot loaded");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Stage;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn populated() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .put(MemoryEntry::with_id("a", json!({ "title": "Rust" })).importance(0.9))
            .unwrap();
        store
            .put(MemoryEntry::with_id("b", json!("plain")).meta("kind", json!("search")))
            .unwrap();
        store.get("a").unwrap();
        store.promote("a").unwrap();
        store
    }

    #[test]
    fn test_save_and_load_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.json");
        let path = path.to_str().unwrap();

        let store = populated();
        assert_eq!(save(&store, path).unwrap(), 2);

        let restored = MemoryStore::new();
        assert_eq!(load(&restored, path).unwrap(), 2);
        assert_eq!(restored.snapshot(), store.snapshot());
        assert_eq!(restored.peek("a").unwrap().stage, Stage::ShortTerm);
        assert_eq!(restored.peek("a").unwrap().access_count, 1);
    }

    #[test]
    fn test_load_rejects_collisions_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let path = path.to_str().unwrap();
        save(&populated(), path).unwrap();

        let target = MemoryStore::new();
        target.put(MemoryEntry::with_id("b", json!("existing"))).unwrap();
        assert!(matches!(load(&target, path), Err(StageMemError::DuplicateId(_))));
        assert_eq!(target.len(), 1);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        std::fs::write(
            &path,
            json!({ "version": 99, "saved_at": Utc::now(), "entries": [] }).to_string(),
        )
        .unwrap();
        assert!(matches!(
            read(path.to_str().unwrap()),
            Err(StageMemError::InvalidInput(_))
        ));
    }
}
