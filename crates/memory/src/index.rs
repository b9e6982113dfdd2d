//! Similarity search seam. The on-disk vector index implementation is out
//! of scope here — [`VectorIndex`] is the trait a real index (`redb`-backed,
//! qdrant, or otherwise) plugs into. [`InMemoryIndex`] is a working
//! reference implementation, not a stub: cosine similarity when both sides
//! carry an embedding, lexical word-overlap otherwise.

use std::collections::HashSet;

use crate::schema::MemoryEntry;

/// A scored candidate: higher is more relevant. Always in `[0.0, 1.0]` for
/// the built-in scoring functions, though the trait itself doesn't demand
/// that range from a custom implementation.
#[derive(Debug, Clone, Copy)]
pub struct ScoredMatch {
    pub index: usize,
    pub score: f32,
}

pub trait VectorIndex: Send + Sync {
    /// Score every entry in `entries` against `query_embedding` (if present)
    /// and `query_text`, returning the top `k` whose score is at least
    /// `relevance_threshold`, highest score first.
    fn search(
        &self,
        entries: &[MemoryEntry],
        query_text: &str,
        query_embedding: Option<&[f32]>,
        k: usize,
        relevance_threshold: f32,
    ) -> Vec<ScoredMatch>;
}

pub struct InMemoryIndex;

impl InMemoryIndex {
    pub fn new() -> Self {
        Self
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_ascii_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn lexical_overlap(query: &str, content: &str) -> f32 {
    let query_words = tokenize(query);
    if query_words.is_empty() {
        return 0.0;
    }
    let content_words = tokenize(content);
    let overlap = query_words.intersection(&content_words).count();
    overlap as f32 / query_words.len() as f32
}

impl VectorIndex for InMemoryIndex {
    fn search(
        &self,
        entries: &[MemoryEntry],
        query_text: &str,
        query_embedding: Option<&[f32]>,
        k: usize,
        relevance_threshold: f32,
    ) -> Vec<ScoredMatch> {
        let mut scored: Vec<ScoredMatch> = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let score = match (query_embedding, entry.embedding.as_deref()) {
                    (Some(q), Some(e)) => cosine_similarity(q, e),
                    _ => lexical_overlap(query_text, &entry.content),
                };
                ScoredMatch { index, score }
            })
            .filter(|m| m.score >= relevance_threshold)
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(content: &str) -> MemoryEntry {
        MemoryEntry::new(content, "test", 0.5)
    }

    #[test]
    fn lexical_fallback_ranks_overlapping_content_higher() {
        let entries = vec![
            entry("the creator asked about rust async traits"),
            entry("unrelated note about groceries"),
        ];
        let index = InMemoryIndex::new();
        let matches = index.search(&entries, "rust async traits", None, 5, 0.1);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].index, 0);
    }

    #[test]
    fn embedding_present_uses_cosine_similarity() {
        let mut a = entry("a");
        a.embedding = Some(vec![1.0, 0.0]);
        let mut b = entry("b");
        b.embedding = Some(vec![0.0, 1.0]);
        let entries = vec![a, b];

        let index = InMemoryIndex::new();
        let matches = index.search(&entries, "", Some(&[1.0, 0.0]), 5, 0.5);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].index, 0);
    }

    #[test]
    fn respects_k_and_threshold() {
        let entries = vec![entry("rust rust rust"), entry("rust"), entry("nothing in common")];
        let index = InMemoryIndex::new();
        let matches = index.search(&entries, "rust", None, 1, 0.5);
        assert_eq!(matches.len(), 1);
    }
}
