//! Stdin REPL attached to a foreground `aigent run`. Runs in the same
//! process as the [`aigent_agent::CoreLoop`], so it can share its
//! [`aigent_state::StateStore`] handle directly and use the wake signal to
//! cut the loop's sleep short — no IPC needed, unlike the operator
//! commands in `control.rs` which only ever see an already-stopped agent's
//! on-disk files.

use std::sync::Arc;
use std::time::Duration;

use aigent_state::StateStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const CHAT_CHANNEL: &str = "cli";
/// How long to wait for a jarvis reply to a line typed at the REPL before
/// giving up and returning control to the prompt. The agent keeps working
/// on it regardless — this bound only affects how long the REPL blocks.
const REPLY_WAIT: Duration = Duration::from_secs(180);

pub(crate) async fn run_repl(state: Arc<StateStore>, wake: Arc<Notify>, shutdown: CancellationToken) {
    println!("aigent REPL — type a message and press enter, or /help for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        use std::io::Write;
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.cancelled() => break,
        };

        let Ok(Some(line)) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/help" => {
                println!("commands: /help, /status, /pause, /resume, /exit");
                continue;
            }
            "/status" => {
                let snapshot = state.snapshot().await;
                println!(
                    "iteration={} paused={} directive={:?} active_task={:?}",
                    snapshot.iteration, snapshot.paused, snapshot.directive, snapshot.active_task
                );
                continue;
            }
            "/pause" => {
                state.set_paused(true).await;
                println!("paused — will take effect at the start of the next iteration");
                continue;
            }
            "/resume" => {
                state.set_paused(false).await;
                wake.notify_one();
                println!("resumed");
                continue;
            }
            "/exit" | "/quit" => break,
            _ => {}
        }

        let sent_id = state.append_chat("creator", line.to_string(), CHAT_CHANNEL, serde_json::json!({})).await;
        wake.notify_one();

        match wait_for_reply(&state, sent_id).await {
            Some(reply) => println!("{reply}"),
            None => println!("(no reply within {}s — still working, check again later)", REPLY_WAIT.as_secs()),
        }
    }
}

async fn wait_for_reply(state: &StateStore, after_id: u64) -> Option<String> {
    let deadline = tokio::time::Instant::now() + REPLY_WAIT;
    loop {
        let pending = state.messages_since(after_id).await;
        if let Some(reply) = pending.iter().find(|m| m.role == "jarvis" && m.channel == CHAT_CHANNEL) {
            return Some(reply.content.clone());
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
