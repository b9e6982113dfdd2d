//! Append-only, date-partitioned audit trail of every event the agent
//! produces: LLM requests/responses, tool calls/results, chat turns,
//! planning decisions, and errors.
//!
//! One file per day (`blob/YYYY-MM-DD.jsonl`) under the configured data
//! directory. Appends go through a single `tokio::sync::Mutex` so the
//! single-writer discipline the rest of the data model relies on holds
//! here too.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobEventType {
    LlmRequest,
    LlmResponse,
    ToolCall,
    ToolResult,
    ChatCreator,
    ChatJarvis,
    System,
    Error,
    Planning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: BlobEventType,
    pub content: String,
    pub metadata: serde_json::Value,
}

impl BlobEvent {
    pub fn new(event_type: BlobEventType, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            content: content.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Supplies "today" for partition naming. A real clock in production; a
/// fixed-date stub in tests so rotation can be asserted deterministically.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

pub struct BlobLog {
    dir: PathBuf,
    clock: Box<dyn Clock>,
    write_lock: Mutex<()>,
}

impl BlobLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(dir, Box::new(SystemClock))
    }

    pub fn with_clock(dir: impl Into<PathBuf>, clock: Box<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            clock,
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append an event to today's partition. Retries once on a transient
    /// I/O error (the open/write failing because a sibling process briefly
    /// held the file, or a momentary disk hiccup) before giving up.
    pub async fn append(&self, event: &BlobEvent) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(self.clock.today());

        match self.append_once(&path, event).await {
            Ok(()) => Ok(()),
            Err(first_err) => {
                tracing::warn!(error = %first_err, path = %path.display(), "blob append failed, retrying once");
                self.append_once(&path, event)
                    .await
                    .with_context(|| format!("appending to blob log at {}", path.display()))
            }
        }
    }

    async fn append_once(&self, path: &Path, event: &BlobEvent) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let line = serde_json::to_string(event)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// All events recorded on `date`, in file order (append order).
    pub async fn read_events_for(&self, date: NaiveDate) -> Result<Vec<BlobEvent>> {
        let path = self.path_for(date);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = tokio::fs::File::open(&path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut events = Vec::new();
        let mut line_no = 0usize;
        while let Some(line) = reader.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BlobEvent>(&line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(line = line_no, error = %err, path = %path.display(), "corrupt blob line — skipping");
                }
            }
        }
        Ok(events)
    }

    /// Last `n` events across the most recent partitions, oldest first.
    /// Walks backward from today until `n` events are collected or 30
    /// consecutive empty days have been scanned.
    pub async fn tail(&self, n: usize) -> Result<Vec<BlobEvent>> {
        let mut collected: Vec<BlobEvent> = Vec::new();
        let mut date = self.clock.today();
        let mut empty_days = 0;

        while collected.len() < n && empty_days < 30 {
            let mut day_events = self.read_events_for(date).await?;
            if day_events.is_empty() {
                empty_days += 1;
            } else {
                empty_days = 0;
                day_events.append(&mut collected);
                collected = day_events;
            }
            date = match date.pred_opt() {
                Some(d) => d,
                None => break,
            };
        }

        if collected.len() > n {
            let drop = collected.len() - n;
            collected.drain(0..drop);
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FixedClock(StdMutex<NaiveDate>);

    impl Clock for FixedClock {
        fn today(&self) -> NaiveDate {
            *self.0.lock().unwrap()
        }
    }

    fn fixed(date: &str) -> Box<dyn Clock> {
        Box::new(FixedClock(StdMutex::new(
            NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        )))
    }

    #[tokio::test]
    async fn append_then_read_events_for_same_day() {
        let dir = tempfile::tempdir().unwrap();
        let log = BlobLog::with_clock(dir.path(), fixed("2026-07-28"));

        log.append(&BlobEvent::new(BlobEventType::System, "boot")).await.unwrap();
        log.append(&BlobEvent::new(BlobEventType::Planning, "iteration 1")).await.unwrap();

        let events = log
            .read_events_for(NaiveDate::parse_from_str("2026-07-28", "%Y-%m-%d").unwrap())
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].content, "boot");
        assert_eq!(events[1].event_type, BlobEventType::Planning);
    }

    #[tokio::test]
    async fn read_events_for_missing_date_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = BlobLog::with_clock(dir.path(), fixed("2026-07-28"));
        let events = log
            .read_events_for(NaiveDate::parse_from_str("2020-01-01", "%Y-%m-%d").unwrap())
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn tail_returns_most_recent_n_events_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = BlobLog::with_clock(dir.path(), fixed("2026-07-28"));

        for i in 0..5 {
            log.append(&BlobEvent::new(BlobEventType::System, format!("event {i}")))
                .await
                .unwrap();
        }

        let tail = log.tail(3).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].content, "event 2");
        assert_eq!(tail[2].content, "event 4");
    }

    #[tokio::test]
    async fn corrupt_line_is_skipped_without_failing_the_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = BlobLog::with_clock(dir.path(), fixed("2026-07-28"));
        log.append(&BlobEvent::new(BlobEventType::System, "good")).await.unwrap();

        let path = dir.path().join("2026-07-28.jsonl");
        let mut existing = tokio::fs::read_to_string(&path).await.unwrap();
        existing.push_str("not json at all\n");
        tokio::fs::write(&path, existing).await.unwrap();

        let events = log
            .read_events_for(NaiveDate::parse_from_str("2026-07-28", "%Y-%m-%d").unwrap())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content, "good");
    }
}
