use std::collections::HashMap;

use uuid::Uuid;

use crate::schema::MemoryEntry;

/// Plain in-process container: insertion order preserved, O(1) lookup by
/// id. No locking of its own — [`crate::manager::MemoryManager`] wraps it
/// in a `RwLock` per the single-writer/parallel-reader rule.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Vec<MemoryEntry>,
    by_id: HashMap<Uuid, usize>,
}

impl MemoryStore {
    pub fn insert(&mut self, entry: MemoryEntry) {
        let idx = self.entries.len();
        self.by_id.insert(entry.id, idx);
        self.entries.push(entry);
    }

    pub fn all(&self) -> &[MemoryEntry] {
        &self.entries
    }

    pub fn all_mut(&mut self) -> &mut [MemoryEntry] {
        &mut self.entries
    }

    pub fn get(&self, id: Uuid) -> Option<&MemoryEntry> {
        self.by_id.get(&id).and_then(|&i| self.entries.get(i))
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut MemoryEntry> {
        if let Some(&idx) = self.by_id.get(&id) {
            self.entries.get_mut(idx)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn reindex(&mut self) {
        self.by_id = self.entries.iter().enumerate().map(|(i, e)| (e.id, i)).collect();
    }

    /// Drop every entry for which `keep` returns `false`. Returns how many
    /// were removed.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&MemoryEntry) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|entry| keep(entry));
        self.reindex();
        before.saturating_sub(self.entries.len())
    }
}
