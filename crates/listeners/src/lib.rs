//! External listeners (§5): concurrent tasks that feed chat messages into
//! the core loop and carry its replies back out. Per the concurrency model,
//! a listener never holds a pointer back into the loop — it only holds a
//! producer handle to the state store's chat log (the "bounded, thread-safe
//! chat queue") and a wake [`tokio::sync::Notify`] to cut the loop's sleep
//! short when something new arrives.
//!
//! Each [`Listener`] implementation owns one external channel (Telegram, a
//! mail inbox, …). [`run_listener`] drives the shared poll/deliver loop so
//! the only channel-specific code lives in the implementations below.

use std::sync::Arc;
use std::time::Duration;

use aigent_state::{ChatMessage, StateStore};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One external chat surface. Implementations are not required to be
/// `Send`-free of interior mutability — `poll_inbound`/`deliver` take `&mut
/// self` because a single listener instance is only ever driven by one
/// `run_listener` task.
#[async_trait]
pub trait Listener: Send {
    /// The `ChatMessage::channel` value this listener owns. Replies tagged
    /// with any other channel are never routed to `deliver`.
    fn channel(&self) -> &str;

    /// Check the external source once for new messages and append each one
    /// to `state` via [`StateStore::append_chat`]. Returns how many were
    /// appended, so the driver knows whether to fire the wake signal.
    async fn poll_inbound(&mut self, state: &StateStore) -> Result<usize>;

    /// Push one already-recorded reply out to the external surface.
    async fn deliver(&mut self, reply: &ChatMessage) -> Result<()>;

    /// How long to wait between polls when nothing happened last time.
    fn poll_interval(&self) -> Duration;
}

/// Drive a listener's poll/deliver cycle until `shutdown` fires. Delivery
/// cursor is local to this task, not persisted — a listener restarted after
/// a crash re-scans the whole chat log and may re-deliver a reply it had
/// already sent externally. `StateStore` has no separate "delivered" bit to
/// recover from, only the monotonic chat log.
pub async fn run_listener(mut listener: Box<dyn Listener>, state: Arc<StateStore>, wake: Arc<Notify>, shutdown: CancellationToken) {
    let channel = listener.channel().to_string();
    let mut delivered_through: u64 = 0;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match listener.poll_inbound(&state).await {
            Ok(0) => {}
            Ok(_) => wake.notify_one(),
            Err(err) => tracing::warn!(channel = %channel, error = %err, "listener poll failed"),
        }

        let pending: Vec<ChatMessage> = state
            .messages_since(delivered_through)
            .await
            .into_iter()
            .filter(|m| m.role == "jarvis" && m.channel == channel)
            .collect();
        for reply in &pending {
            if let Err(err) = listener.deliver(reply).await {
                tracing::warn!(channel = %channel, error = %err, "listener delivery failed");
            }
            delivered_through = delivered_through.max(reply.id);
        }

        tokio::select! {
            _ = tokio::time::sleep(listener.poll_interval()) => {}
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Long-polls the Telegram Bot API's `getUpdates`, mirroring the offset/409
/// backoff handling of a standard Telegram bot poll loop. Replies are sent
/// back via `sendMessage` to whichever chat the most recent inbound message
/// came from.
pub struct TelegramListener {
    client: reqwest::Client,
    base_url: String,
    offset: i64,
    last_chat_id: Option<i64>,
    backoff: Duration,
}

impl TelegramListener {
    pub fn new(bot_token: impl AsRef<str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{}", bot_token.as_ref()),
            offset: 0,
            last_chat_id: None,
            backoff: Duration::from_secs(2),
        }
    }
}

#[derive(serde::Deserialize)]
struct TgUpdatesResponse {
    result: Vec<TgUpdate>,
}

#[derive(serde::Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
}

#[derive(serde::Deserialize)]
struct TgMessage {
    chat: TgChat,
    text: Option<String>,
}

#[derive(serde::Deserialize)]
struct TgChat {
    id: i64,
}

#[async_trait]
impl Listener for TelegramListener {
    fn channel(&self) -> &str {
        "telegram"
    }

    async fn poll_inbound(&mut self, state: &StateStore) -> Result<usize> {
        let url = format!("{}/getUpdates", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("offset", self.offset.to_string()), ("timeout", "0".to_string())])
            .timeout(Duration::from_secs(30))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(err) => {
                self.backoff = (self.backoff * 2).min(Duration::from_secs(30));
                return Err(err.into());
            }
        };

        if response.status() == reqwest::StatusCode::CONFLICT {
            tracing::warn!("telegram 409 conflict: another instance is polling");
            self.backoff = Duration::from_secs(15);
            return Ok(0);
        }
        self.backoff = Duration::from_secs(2);

        let parsed: TgUpdatesResponse = response.error_for_status()?.json().await?;
        let mut appended = 0;
        for update in parsed.result {
            self.offset = update.update_id + 1;
            let Some(message) = update.message else { continue };
            let Some(text) = message.text else { continue };
            self.last_chat_id = Some(message.chat.id);
            state
                .append_chat("creator", text, self.channel(), serde_json::json!({ "chat_id": message.chat.id }))
                .await;
            appended += 1;
        }
        Ok(appended)
    }

    async fn deliver(&mut self, reply: &ChatMessage) -> Result<()> {
        let Some(chat_id) = self.last_chat_id else {
            tracing::warn!("telegram reply with no known chat_id to deliver to, dropping");
            return Ok(());
        };
        let url = format!("{}/sendMessage", self.base_url);
        self.client
            .post(&url)
            .json(&serde_json::json!({ "chat_id": chat_id, "text": reply.content }))
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        self.backoff
    }
}

/// Polls a mail inbox exposed as JSON by an external bridge — the actual
/// IMAP/SMTP wire protocol is out of scope here (the spec treats mail send
/// as an opaque tool body); this listener only needs something that can
/// list new messages and accept a reply.
pub struct EmailListener {
    client: reqwest::Client,
    inbox_url: String,
    send_url: String,
    api_key: String,
    last_from: Option<String>,
}

impl EmailListener {
    pub fn new(inbox_url: impl Into<String>, send_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            inbox_url: inbox_url.into(),
            send_url: send_url.into(),
            api_key: api_key.into(),
            last_from: None,
        }
    }
}

#[derive(serde::Deserialize)]
struct EmailMessage {
    from: String,
    body: String,
}

#[async_trait]
impl Listener for EmailListener {
    fn channel(&self) -> &str {
        "email"
    }

    async fn poll_inbound(&mut self, state: &StateStore) -> Result<usize> {
        let messages: Vec<EmailMessage> = self
            .client
            .get(&self.inbox_url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut appended = 0;
        for message in messages {
            self.last_from = Some(message.from.clone());
            state
                .append_chat("creator", message.body, self.channel(), serde_json::json!({ "from": message.from }))
                .await;
            appended += 1;
        }
        Ok(appended)
    }

    async fn deliver(&mut self, reply: &ChatMessage) -> Result<()> {
        let Some(to) = self.last_from.clone() else {
            tracing::warn!("email reply with no known recipient to deliver to, dropping");
            return Ok(());
        };
        self.client
            .post(&self.send_url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "to": to, "body": reply.content }))
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingListener {
        channel: String,
        inbound_batches: Vec<usize>,
        delivered: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Listener for CountingListener {
        fn channel(&self) -> &str {
            &self.channel
        }

        async fn poll_inbound(&mut self, _state: &StateStore) -> Result<usize> {
            Ok(self.inbound_batches.pop().unwrap_or(0))
        }

        async fn deliver(&mut self, reply: &ChatMessage) -> Result<()> {
            self.delivered.lock().unwrap().push(reply.content.clone());
            Ok(())
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_millis(10)
        }
    }

    #[tokio::test]
    async fn run_listener_delivers_only_matching_channel_replies() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateStore::load(dir.path().join("state.json")).await.unwrap());
        state.append_chat("creator", "hi", "telegram", serde_json::json!({})).await;
        state.append_chat("jarvis", "reply on telegram", "telegram", serde_json::json!({})).await;
        state.append_chat("jarvis", "reply on email", "email", serde_json::json!({})).await;

        let delivered = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let listener = Box::new(CountingListener {
            channel: "telegram".to_string(),
            inbound_batches: vec![],
            delivered: delivered.clone(),
        });

        let wake = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let state_clone = state.clone();

        let handle = tokio::spawn(async move { run_listener(listener, state_clone, wake, shutdown_clone).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], "reply on telegram");
    }

    #[tokio::test]
    async fn run_listener_wakes_on_new_inbound_messages() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateStore::load(dir.path().join("state.json")).await.unwrap());

        let listener = Box::new(CountingListener {
            channel: "telegram".to_string(),
            inbound_batches: vec![2],
            delivered: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        });

        let wake = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let state_clone = state.clone();
        let wake_clone = wake.clone();

        let handle = tokio::spawn(async move { run_listener(listener, state_clone, wake_clone, shutdown_clone).await });

        tokio::time::timeout(Duration::from_secs(1), wake.notified()).await.expect("wake should fire");
        shutdown.cancel();
        handle.await.unwrap();
    }
}
