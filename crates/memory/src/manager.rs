//! Owns the vector memory store and the short-term notes scratchpad, and
//! wires them together for the retrieval step of working-context assembly.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use uuid::Uuid;

use crate::index::{InMemoryIndex, VectorIndex};
use crate::schema::MemoryEntry;
use crate::short_term::{Note, ShortTermNotes};
use crate::store::MemoryStore;

/// Optional embedder. `None` means retrieval falls back to lexical overlap
/// scoring — a real embedding model is an individual tool body, out of
/// scope here; this is the seam it plugs into.
pub type EmbedFn = Arc<dyn Fn(&str) -> Option<Vec<f32>> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub entry_count: usize,
    pub permanent_count: usize,
    pub short_term_count: usize,
}

pub struct MemoryManager {
    store: RwLock<MemoryStore>,
    short_term: RwLock<ShortTermNotes>,
    index: Box<dyn VectorIndex>,
    embed_fn: Option<EmbedFn>,
    decay_factor: f32,
    importance_expiry_threshold: f32,
}

impl MemoryManager {
    pub fn new(short_term_capacity: usize, short_term_max_age_hours: i64) -> Self {
        Self {
            store: RwLock::new(MemoryStore::default()),
            short_term: RwLock::new(ShortTermNotes::new(short_term_capacity, short_term_max_age_hours)),
            index: Box::new(InMemoryIndex::new()),
            embed_fn: None,
            decay_factor: 0.98,
            importance_expiry_threshold: 0.05,
        }
    }

    pub fn from_config(config: &aigent_config::MemoryConfig) -> Self {
        Self::new(config.short_term_capacity, config.short_term_max_age_hours)
            .with_decay(config.decay_factor, config.importance_expiry_threshold)
    }

    pub fn with_decay(mut self, decay_factor: f32, importance_expiry_threshold: f32) -> Self {
        self.decay_factor = decay_factor;
        self.importance_expiry_threshold = importance_expiry_threshold;
        self
    }

    pub fn set_embed_fn(&mut self, f: EmbedFn) {
        self.embed_fn = Some(f);
    }

    pub fn set_index(&mut self, index: Box<dyn VectorIndex>) {
        self.index = index;
    }

    /// Insert a finding, embedding it if an embedder is configured.
    /// Important findings are the caller's job to flag: pass a high
    /// `importance` and call `.permanent()`/`.with_ttl_hours()` on the
    /// entry beforehand if it should survive or expire on a schedule.
    pub fn insert(&self, mut entry: MemoryEntry) -> Uuid {
        if entry.embedding.is_none() {
            if let Some(embed) = &self.embed_fn {
                entry.embedding = embed(&entry.content);
            }
        }
        let id = entry.id;
        self.store.write().expect("memory store lock poisoned").insert(entry);
        id
    }

    /// Top-k retrieval per §4.4 step 2: similarity to `query`, entries
    /// scoring at least `relevance_threshold`. Reinforces every returned
    /// entry's access bookkeeping.
    pub fn retrieve(&self, query: &str, k: usize, relevance_threshold: f32) -> Vec<MemoryEntry> {
        let query_embedding = self.embed_fn.as_ref().and_then(|embed| embed(query));
        let mut store = self.store.write().expect("memory store lock poisoned");
        let matches = self.index.search(store.all(), query, query_embedding.as_deref(), k, relevance_threshold);

        let now = Utc::now();
        let mut results = Vec::with_capacity(matches.len());
        for m in matches {
            if let Some(entry) = store.all_mut().get_mut(m.index) {
                entry.reinforce(now);
                results.push(entry.clone());
            }
        }
        results
    }

    pub fn push_short_term_note(&self, content: impl Into<String>, iteration: u64) {
        self.short_term.write().expect("short-term lock poisoned").push(content, iteration);
    }

    pub fn recent_short_term_notes(&self, limit: usize) -> Vec<Note> {
        self.short_term
            .read()
            .expect("short-term lock poisoned")
            .recent(limit)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Every-10th-iteration sweep per §4.1: decay non-permanent importances,
    /// drop entries past TTL with importance below threshold, and expire
    /// stale short-term notes. Returns how many vector entries were removed.
    pub fn run_maintenance(&self) -> usize {
        let now = Utc::now();
        let mut store = self.store.write().expect("memory store lock poisoned");
        for entry in store.all_mut() {
            entry.decay(self.decay_factor);
        }
        let removed = store.retain(|entry| !entry.is_expired(now, self.importance_expiry_threshold));

        self.short_term.write().expect("short-term lock poisoned").sweep_expired(now);
        removed
    }

    pub fn stats(&self) -> MemoryStats {
        let store = self.store.read().expect("memory store lock poisoned");
        let permanent_count = store.all().iter().filter(|e| e.permanent).count();
        MemoryStats {
            entry_count: store.len(),
            permanent_count,
            short_term_count: self.short_term.read().expect("short-term lock poisoned").len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn insert_and_retrieve_round_trips_lexically() {
        let manager = MemoryManager::new(50, 48);
        manager.insert(MemoryEntry::new("the creator prefers terse replies", "chat", 0.6));
        manager.insert(MemoryEntry::new("unrelated grocery list", "chat", 0.3));

        let results = manager.retrieve("creator prefers terse replies", 5, 0.1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "the creator prefers terse replies");
        assert_eq!(results[0].access_count, 1);
    }

    #[test]
    fn permanent_entries_survive_maintenance_decay_to_zero() {
        let manager = MemoryManager::new(50, 48).with_decay(0.0, 0.05);
        let mut permanent = MemoryEntry::new("core fact", "system", 1.0);
        permanent = permanent.permanent();
        manager.insert(permanent);

        manager.run_maintenance();
        let stats = manager.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.permanent_count, 1);
    }

    #[test]
    fn maintenance_expires_low_importance_entries_past_ttl() {
        let manager = MemoryManager::new(50, 48).with_decay(1.0, 0.5);
        let mut entry = MemoryEntry::new("ephemeral", "tool", 0.1).with_ttl_hours(1);
        entry.created_at = Utc::now() - Duration::hours(2);
        manager.insert(entry);

        let removed = manager.run_maintenance();
        assert_eq!(removed, 1);
        assert_eq!(manager.stats().entry_count, 0);
    }

    #[test]
    fn decay_lowers_importance_without_dropping_above_ttl() {
        let manager = MemoryManager::new(50, 48).with_decay(0.5, 0.0);
        manager.insert(MemoryEntry::new("stays around", "tool", 0.8));
        manager.run_maintenance();

        let results = manager.retrieve("stays around", 1, 0.0);
        assert!((results[0].importance - 0.4).abs() < 1e-6);
    }

    #[test]
    fn short_term_notes_are_retrievable_most_recent_first() {
        let manager = MemoryManager::new(50, 48);
        manager.push_short_term_note("first", 1);
        manager.push_short_term_note("second", 2);
        let recent = manager.recent_short_term_notes(10);
        assert_eq!(recent[0].content, "second");
    }
}
