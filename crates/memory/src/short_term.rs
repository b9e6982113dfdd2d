use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub idx: u64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub iteration: u64,
}

/// Bounded FIFO scratchpad the planner reads every iteration. Strict
/// capacity eviction on insert, plus an age-based sweep (default 48h) run
/// opportunistically on insert and explicitly every maintenance pass.
#[derive(Debug)]
pub struct ShortTermNotes {
    capacity: usize,
    max_age_hours: i64,
    notes: VecDeque<Note>,
    next_idx: u64,
}

impl ShortTermNotes {
    pub fn new(capacity: usize, max_age_hours: i64) -> Self {
        Self { capacity, max_age_hours, notes: VecDeque::new(), next_idx: 0 }
    }

    pub fn push(&mut self, content: impl Into<String>, iteration: u64) {
        self.sweep_expired(Utc::now());
        let idx = self.next_idx;
        self.next_idx += 1;
        self.notes.push_back(Note { idx, content: content.into(), created_at: Utc::now(), iteration });
        while self.notes.len() > self.capacity {
            self.notes.pop_front();
        }
    }

    /// Drop notes older than `max_age_hours`. Returns how many were removed.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.notes.len();
        let max_age_hours = self.max_age_hours;
        self.notes.retain(|note| now.signed_duration_since(note.created_at).num_hours() < max_age_hours);
        before.saturating_sub(self.notes.len())
    }

    /// Most recent first, up to `limit`.
    pub fn recent(&self, limit: usize) -> Vec<&Note> {
        self.notes.iter().rev().take(limit).collect()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn eviction_keeps_only_the_capacity_most_recent() {
        let mut notes = ShortTermNotes::new(3, 48);
        for i in 0..5 {
            notes.push(format!("note {i}"), i);
        }
        assert_eq!(notes.len(), 3);
        let recent = notes.recent(10);
        assert_eq!(recent[0].content, "note 4");
        assert_eq!(recent[2].content, "note 2");
    }

    #[test]
    fn sweep_removes_notes_older_than_max_age() {
        let mut notes = ShortTermNotes::new(50, 48);
        notes.push("old", 0);
        notes.notes[0].created_at = Utc::now() - Duration::hours(49);
        notes.push("fresh", 1);

        let removed = notes.sweep_expired(Utc::now());
        assert_eq!(removed, 1);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes.recent(10)[0].content, "fresh");
    }

    #[test]
    fn recent_respects_limit_and_ordering() {
        let mut notes = ShortTermNotes::new(50, 48);
        notes.push("a", 0);
        notes.push("b", 1);
        notes.push("c", 2);
        let recent = notes.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "c");
        assert_eq!(recent[1].content, "b");
    }
}
