//! Staged memory store
//!
//! Holds every [`MemoryEntry`] behind one lock:
//! - mutations (`put`, `get`, `update_importance`, `promote`, `demote`,
//!   `evict`) take the write lock, so each is atomic per entry and globally
//! - listings take the read lock and clone, so they never observe a
//!   half-applied transition

mod ordering;

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use crate::error::{Result, StageMemError};
use crate::types::{clamp_importance, EntryId, MemoryEntry, Stage, StageStats};

pub use ordering::listing_order;

/// In-process store owning all memory entries
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<EntryId, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry at the working stage
    pub fn put(&self, mut entry: MemoryEntry) -> Result<EntryId> {
        entry.stage = Stage::Working;
        entry.importance = clamp_importance(entry.importance);

        let mut entries = self.entries.write();
        if entries.contains_key(&entry.id) {
            return Err(StageMemError::DuplicateId(entry.id));
        }
        let id = entry.id.clone();
        entries.insert(id.clone(), entry);
        Ok(id)
    }

    /// Read an entry, recording the access
    pub fn get(&self, id: &str) -> Result<MemoryEntry> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| StageMemError::NotFound(id.to_string()))?;
        entry.access_count = entry.access_count.saturating_add(1);
        entry.last_accessed_at = Some(Utc::now());
        Ok(entry.clone())
    }

    /// Read an entry without touching its access statistics
    pub fn peek(&self, id: &str) -> Result<MemoryEntry> {
        self.entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StageMemError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Adjust importance by `delta`, clamped into [0, 1]; returns the new value
    pub fn update_importance(&self, id: &str, delta: f32) -> Result<f32> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| StageMemError::NotFound(id.to_string()))?;
        entry.importance = clamp_importance(entry.importance + delta);
        Ok(entry.importance)
    }

    /// Entries of one stage in listing order
    pub fn list_by_stage(&self, stage: Stage) -> Vec<MemoryEntry> {
        let mut listed: Vec<MemoryEntry> = self
            .entries
            .read()
            .values()
            .filter(|e| e.stage == stage)
            .cloned()
            .collect();
        listed.sort_by(listing_order);
        listed
    }

    /// Remove an entry permanently. Absent ids are a no-op; returns whether
    /// anything was removed.
    pub fn evict(&self, id: &str) -> bool {
        self.entries.write().remove(id).is_some()
    }

    /// Move one stage forward
    pub fn promote(&self, id: &str) -> Result<Stage> {
        let mut entries = self.entries.write();
        step(&mut entries, id, Direction::Forward)
    }

    /// Move one stage backward
    pub fn demote(&self, id: &str) -> Result<Stage> {
        let mut entries = self.entries.write();
        step(&mut entries, id, Direction::Backward)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> StageStats {
        let mut stats = StageStats::default();
        for entry in self.entries.read().values() {
            stats.bump(entry.stage);
        }
        stats
    }

    /// Every entry, ordered by id
    pub fn snapshot(&self) -> Vec<MemoryEntry> {
        let mut all: Vec<MemoryEntry> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Bulk-load entries keeping their stage and access statistics.
    /// Nothing is inserted if any id collides.
    pub fn restore(&self, restored: Vec<MemoryEntry>) -> Result<usize> {
        let mut entries = self.entries.write();
        {
            let mut seen = std::collections::HashSet::with_capacity(restored.len());
            for entry in &restored {
                if entries.contains_key(&entry.id) || !seen.insert(entry.id.as_str()) {
                    return Err(StageMemError::DuplicateId(entry.id.clone()));
                }
            }
        }
        let count = restored.len();
        for mut entry in restored {
            entry.importance = clamp_importance(entry.importance);
            entries.insert(entry.id.clone(), entry);
        }
        Ok(count)
    }

    /// Run `f` with exclusive access to the whole entry map.
    ///
    /// Used by the stage scheduler so a pass is atomic with respect to
    /// concurrent writes.
    pub(crate) fn with_entries_mut<T>(
        &self,
        f: impl FnOnce(&mut HashMap<EntryId, MemoryEntry>) -> T,
    ) -> T {
        let mut entries = self.entries.write();
        f(&mut entries)
    }
}

#[derive(Clone, Copy)]
pub(crate) enum Direction {
    Forward,
    Backward,
}

pub(crate) fn step(
    entries: &mut HashMap<EntryId, MemoryEntry>,
    id: &str,
    direction: Direction,
) -> Result<Stage> {
    let entry = entries
        .get_mut(id)
        .ok_or_else(|| StageMemError::NotFound(id.to_string()))?;
    let target = match direction {
        Direction::Forward => entry
            .stage
            .next()
            .ok_or_else(|| StageMemError::boundary(id, entry.stage, "promote"))?,
        Direction::Backward => entry
            .stage
            .previous()
            .ok_or_else(|| StageMemError::boundary(id, entry.stage, "demote"))?,
    };
    entry.stage = target;
    Ok(target)
}
