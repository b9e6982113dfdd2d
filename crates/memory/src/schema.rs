use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single vector memory entry. `embedding` is `None` when no embedder is
/// configured — retrieval then falls back to lexical overlap scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub importance: f32,
    pub source: String,
    /// Permanent entries are never decayed or expired by the maintenance
    /// pass, regardless of `ttl_hours`.
    pub permanent: bool,
    pub created_at: DateTime<Utc>,
    pub ttl_hours: Option<u64>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>, source: impl Into<String>, importance: f32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            embedding: None,
            importance: importance.clamp(0.0, 1.0),
            source: source.into(),
            permanent: false,
            created_at: now,
            ttl_hours: None,
            access_count: 0,
            last_accessed: now,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    pub fn with_ttl_hours(mut self, hours: u64) -> Self {
        self.ttl_hours = Some(hours);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>, importance_expiry_threshold: f32) -> bool {
        if self.permanent {
            return false;
        }
        let age = now.signed_duration_since(self.created_at);
        let ttl_exceeded = match self.ttl_hours {
            Some(hours) => age.num_hours() >= hours as i64,
            None => false,
        };
        ttl_exceeded && self.importance < importance_expiry_threshold
    }

    /// Explicit re-access: bumps `importance` upward, the one path by which
    /// importance is allowed to increase (decay only ever lowers it).
    pub fn reinforce(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed = now;
        self.importance = (self.importance + 0.05).min(1.0);
    }

    pub fn decay(&mut self, decay_factor: f32) {
        if self.permanent {
            return;
        }
        self.importance *= decay_factor;
    }
}

pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut truncated: String = s.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}
