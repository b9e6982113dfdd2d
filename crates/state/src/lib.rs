//! Durable agent state: directive, goals, iteration counter, pause flag,
//! chat cursor, and the chat message log the core loop drains from.
//!
//! Single-writer (the core loop), many-reader (CLI introspection, listeners
//! checking the pause flag). Callers share a [`StateStore`] behind an `Arc`
//! and rely on its internal lock rather than taking their own.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// The three goal tiers the planner reads every iteration. Longer-horizon
/// goals are revised far less often than short-horizon ones.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Goals {
    pub long_term: Vec<String>,
    pub medium_term: Vec<String>,
    pub short_term: Vec<String>,
}

/// Per-agent overrides to the configured memory defaults. Left at `None`
/// until an operator or the agent itself tunes them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MemoryOverrides {
    pub retrieval_count: Option<usize>,
    pub relevance_threshold: Option<f32>,
    pub decay_factor: Option<f32>,
    pub max_context_tokens: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub metadata: serde_json::Value,
}

/// The full durable snapshot persisted to `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentState {
    pub directive: String,
    pub goals: Goals,
    pub iteration: u64,
    pub paused: bool,
    pub chat_cursor: u64,
    pub memory_overrides: MemoryOverrides,
    pub chat_log: VecDeque<ChatMessage>,
    /// Tool name of the last action taken, used by the core loop's adaptive
    /// sleep heuristic (non-idle ⇒ shorter sleep). `None` once an iteration
    /// runs no actions.
    pub active_task: Option<String>,
    next_chat_id: u64,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            directive: String::new(),
            goals: Goals::default(),
            iteration: 0,
            paused: false,
            chat_cursor: 0,
            memory_overrides: MemoryOverrides::default(),
            chat_log: VecDeque::new(),
            active_task: None,
            next_chat_id: 1,
        }
    }
}

/// Bound on how many delivered chat messages are retained in the on-disk
/// log. Older messages are still in the blob log for audit purposes; this
/// cap only limits what `state.json` carries around.
const CHAT_LOG_RETENTION: usize = 2000;

pub struct StateStore {
    path: PathBuf,
    state: RwLock<AgentState>,
}

impl StateStore {
    /// Load state from `path`, falling back to a fresh default if the file
    /// doesn't exist yet (first boot).
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parsing state file at {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => AgentState::default(),
            Err(err) => return Err(err).context("reading state file"),
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    /// Persist the current state to disk via write-then-rename so a crash
    /// mid-write never corrupts the live file.
    pub async fn save(&self) -> Result<()> {
        let snapshot = self.state.read().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = serde_json::to_string_pretty(&*snapshot)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, rendered)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub async fn snapshot(&self) -> AgentState {
        self.state.read().await.clone()
    }

    pub async fn directive(&self) -> String {
        self.state.read().await.directive.clone()
    }

    pub async fn set_directive(&self, directive: impl Into<String>) {
        self.state.write().await.directive = directive.into();
    }

    pub async fn goals(&self) -> Goals {
        self.state.read().await.goals.clone()
    }

    pub async fn set_goals(&self, goals: Goals) {
        self.state.write().await.goals = goals;
    }

    pub async fn iteration(&self) -> u64 {
        self.state.read().await.iteration
    }

    pub async fn advance_iteration(&self) -> u64 {
        let mut state = self.state.write().await;
        state.iteration += 1;
        state.iteration
    }

    pub async fn is_paused(&self) -> bool {
        self.state.read().await.paused
    }

    pub async fn set_paused(&self, paused: bool) {
        self.state.write().await.paused = paused;
    }

    pub async fn memory_overrides(&self) -> MemoryOverrides {
        self.state.read().await.memory_overrides.clone()
    }

    pub async fn set_memory_overrides(&self, overrides: MemoryOverrides) {
        self.state.write().await.memory_overrides = overrides;
    }

    pub async fn active_task(&self) -> Option<String> {
        self.state.read().await.active_task.clone()
    }

    pub async fn set_active_task(&self, active_task: Option<String>) {
        self.state.write().await.active_task = active_task;
    }

    /// Append an incoming chat message, assigning it the next id. Returns
    /// the assigned id.
    pub async fn append_chat(
        &self,
        role: impl Into<String>,
        content: impl Into<String>,
        channel: impl Into<String>,
        metadata: serde_json::Value,
    ) -> u64 {
        let mut state = self.state.write().await;
        let id = state.next_chat_id;
        state.next_chat_id += 1;
        state.chat_log.push_back(ChatMessage {
            id,
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
            channel: channel.into(),
            metadata,
        });
        while state.chat_log.len() > CHAT_LOG_RETENTION {
            state.chat_log.pop_front();
        }
        id
    }

    /// Messages with id strictly greater than `cursor`, in ascending order.
    pub async fn messages_since(&self, cursor: u64) -> Vec<ChatMessage> {
        self.state
            .read()
            .await
            .chat_log
            .iter()
            .filter(|m| m.id > cursor)
            .cloned()
            .collect()
    }

    pub async fn chat_cursor(&self) -> u64 {
        self.state.read().await.chat_cursor
    }

    pub async fn set_chat_cursor(&self, cursor: u64) {
        self.state.write().await.chat_cursor = cursor;
    }

    /// Drain every undelivered message (those past the current cursor) and
    /// advance the cursor to the last one returned. Used by the core loop's
    /// non-blocking chat-queue drain (step 2 of the iteration algorithm).
    pub async fn drain_unread(&self) -> Vec<ChatMessage> {
        let mut state = self.state.write().await;
        let unread: Vec<ChatMessage> = state
            .chat_log
            .iter()
            .filter(|m| m.id > state.chat_cursor)
            .cloned()
            .collect();
        if let Some(last) = unread.last() {
            state.chat_cursor = last.id;
        }
        unread
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_store_has_empty_directive_and_zero_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).await.unwrap();
        assert_eq!(store.directive().await, "");
        assert_eq!(store.iteration().await, 0);
        assert!(!store.is_paused().await);
    }

    #[tokio::test]
    async fn save_then_load_round_trips_directive_and_goals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::load(&path).await.unwrap();
        store.set_directive("help the creator ship aigent").await;
        store
            .set_goals(Goals {
                long_term: vec!["stay useful".into()],
                medium_term: vec![],
                short_term: vec!["reply to pending chat".into()],
            })
            .await;
        store.advance_iteration().await;
        store.save().await.unwrap();

        let reloaded = StateStore::load(&path).await.unwrap();
        assert_eq!(reloaded.directive().await, "help the creator ship aigent");
        assert_eq!(reloaded.goals().await.long_term, vec!["stay useful"]);
        assert_eq!(reloaded.iteration().await, 1);
    }

    #[tokio::test]
    async fn drain_unread_advances_cursor_and_does_not_redeliver() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).await.unwrap();

        store
            .append_chat("creator", "hello", "telegram", serde_json::json!({}))
            .await;
        store
            .append_chat("creator", "are you there?", "telegram", serde_json::json!({}))
            .await;

        let first_drain = store.drain_unread().await;
        assert_eq!(first_drain.len(), 2);
        assert_eq!(first_drain[0].content, "hello");

        let second_drain = store.drain_unread().await;
        assert!(second_drain.is_empty());
    }

    #[tokio::test]
    async fn messages_since_filters_by_cursor_without_mutating_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).await.unwrap();

        let first_id = store
            .append_chat("creator", "one", "email", serde_json::json!({}))
            .await;
        store
            .append_chat("creator", "two", "email", serde_json::json!({}))
            .await;

        let since = store.messages_since(first_id).await;
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].content, "two");
        assert_eq!(store.chat_cursor().await, 0);
    }

    #[tokio::test]
    async fn paused_flag_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).await.unwrap();
        store.set_paused(true).await;
        assert!(store.is_paused().await);
    }
}
