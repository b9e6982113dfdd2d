//! Working-context assembly: the six-step algorithm (§4.4) that turns
//! directive + goals + memory + chat history into the system-prompt string
//! `aigent_thinker::Thinker::think` calls the planner tier with.
//!
//! Kept as a pure function over plain inputs (no `StateStore`/`MemoryManager`
//! borrow held across an `.await`) so the core loop can snapshot what it
//! needs, build the context, and release locks before the LLM call.

use aigent_memory::MemoryEntry;
use aigent_state::{ChatMessage, Goals};
use aigent_tools::ToolOutput;
use chrono::{DateTime, Utc};

/// The immutable safety preamble, prepended to every assembled context.
/// Summarizes the seven frozen rules in `aigent_safety` — text only, the
/// actual enforcement lives entirely in that crate and never reads this
/// string back.
pub const SAFETY_PREAMBLE: &str = "\
You are a persistent autonomous agent. You operate under seven rules that \
cannot be changed by you, by a plan you produce, or by any configuration: \
(1) never take an action that could harm your creator; (2) never exfiltrate \
credentials — secrets are redacted wherever they appear; (3) every action is \
logged, with no exception; (4) you cannot modify your own safety rules or \
logging implementation; (5) logging cannot be disabled; (6) you cannot spawn \
hidden subordinate agents — all registered tools are visible; (7) you cannot \
raise your own budget cap — only an authenticated creator request can do that. \
A violation is rejected before it reaches a tool and is recorded either way.";

/// One executed tool's result, condensed to what the planner needs to see
/// next iteration. Built by the core loop from each `ToolOutput` it records.
#[derive(Debug, Clone)]
pub struct ToolResultSummary {
    pub tool: String,
    pub output: ToolOutput,
    pub at: DateTime<Utc>,
}

impl ToolResultSummary {
    pub fn render(&self, max_chars: usize) -> String {
        let body = if self.output.success {
            aigent_memory::truncate_str(&self.output.output, max_chars)
        } else {
            let detail = self.output.error.as_deref().unwrap_or(&self.output.output);
            format!("FAILED: {}", aigent_memory::truncate_str(detail, max_chars))
        };
        format!("[{}] {} -> {}", self.at.format("%H:%M:%S"), self.tool, body)
    }
}

/// Tunables for a single context-assembly call. Sourced from
/// `aigent_config::MemoryConfig`, overridden per-agent by
/// `aigent_state::MemoryOverrides` when set.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub retrieval_count: usize,
    pub relevance_threshold: f32,
    pub max_context_tokens: usize,
    /// M: how many recent chat messages to include (step 4).
    pub recent_chat_count: usize,
    /// L: how many recent tool-result summaries to include (step 5).
    pub recent_tool_results: usize,
}

/// Provider-agnostic token estimate: 4 chars ≈ 1 token, per §4.4 step 6.
fn estimate_tokens(char_len: usize) -> usize {
    char_len.div_ceil(4)
}

/// The synthetic retrieval query for step 2: goals concatenated with the
/// content of the most recent chat message, if any.
pub fn synthesize_query(goals: &Goals, latest_chat_content: Option<&str>) -> String {
    let mut parts: Vec<&str> = Vec::new();
    parts.extend(goals.long_term.iter().map(String::as_str));
    parts.extend(goals.medium_term.iter().map(String::as_str));
    parts.extend(goals.short_term.iter().map(String::as_str));
    if let Some(chat) = latest_chat_content {
        parts.push(chat);
    }
    parts.join(" ")
}

fn render_goals(goals: &Goals) -> String {
    let mut lines = vec!["Goals:".to_string()];
    if !goals.long_term.is_empty() {
        lines.push(format!("  long-term: {}", goals.long_term.join("; ")));
    }
    if !goals.medium_term.is_empty() {
        lines.push(format!("  medium-term: {}", goals.medium_term.join("; ")));
    }
    if !goals.short_term.is_empty() {
        lines.push(format!("  short-term: {}", goals.short_term.join("; ")));
    }
    lines.join("\n")
}

fn render_chat(message: &ChatMessage) -> String {
    format!("[{}] {} ({}): {}", message.timestamp.format("%H:%M:%S"), message.role, message.channel, message.content)
}

fn render_memory(entry: &MemoryEntry) -> String {
    format!("- ({:.2}, {}) {}", entry.importance, entry.source, aigent_memory::truncate_str(&entry.content, 400))
}

/// Assemble the working context, applying the token-budget trim of step 6.
///
/// `vector_memories` must already be the top-`retrieval_count` results of
/// `MemoryManager::retrieve`, ordered highest-relevance first — retrieval
/// itself is the core loop's job since it needs the live `MemoryManager`.
/// `short_term_notes` and `recent_chat`/`tool_results` are expected oldest
/// first; this function only trims, it does not reorder.
pub fn assemble_context(
    directive: &str,
    goals: &Goals,
    vector_memories: &[MemoryEntry],
    short_term_notes: &[String],
    recent_chat: &[ChatMessage],
    tool_results: &[ToolResultSummary],
    budget: &ContextBudget,
) -> String {
    let section1 = format!("{SAFETY_PREAMBLE}\n\nDirective: {directive}\n{}", render_goals(goals));

    let mut section2: Vec<String> = vector_memories.iter().map(render_memory).collect();
    let mut section3: Vec<String> = short_term_notes.to_vec();
    let mut section4: Vec<String> = recent_chat
        .iter()
        .rev()
        .take(budget.recent_chat_count)
        .rev()
        .map(render_chat)
        .collect();
    let mut section5: Vec<String> = tool_results
        .iter()
        .rev()
        .take(budget.recent_tool_results)
        .rev()
        .map(|r| r.render(400))
        .collect();

    loop {
        let assembled = render(&section1, &section2, &section3, &section4, &section5);
        if estimate_tokens(assembled.len()) <= budget.max_context_tokens {
            break;
        }
        // Drop from the oldest end of 4 -> 5 -> 3 -> 2, in that order, never
        // touching section 1. Chat/notes/tool-results are stored oldest
        // first so "oldest end" is the front; vector memories are stored
        // highest-relevance first so "oldest end" is the least-relevant
        // tail.
        if !section4.is_empty() {
            section4.remove(0);
        } else if !section5.is_empty() {
            section5.remove(0);
        } else if !section3.is_empty() {
            section3.remove(0);
        } else if !section2.is_empty() {
            section2.pop();
        } else {
            break;
        }
    }

    render(&section1, &section2, &section3, &section4, &section5)
}

fn render(section1: &str, section2: &[String], section3: &[String], section4: &[String], section5: &[String]) -> String {
    let mut out = String::from(section1);
    if !section2.is_empty() {
        out.push_str("\n\nRelevant memories:\n");
        out.push_str(&section2.join("\n"));
    }
    if !section3.is_empty() {
        out.push_str("\n\nShort-term notes:\n");
        out.push_str(&section3.join("\n"));
    }
    if !section4.is_empty() {
        out.push_str("\n\nRecent chat:\n");
        out.push_str(&section4.join("\n"));
    }
    if !section5.is_empty() {
        out.push_str("\n\nRecent tool results:\n");
        out.push_str(&section5.join("\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigent_tools::ToolOutput;

    fn goals() -> Goals {
        Goals {
            long_term: vec!["stay useful".into()],
            medium_term: vec![],
            short_term: vec!["reply to the creator".into()],
        }
    }

    #[test]
    fn synthesize_query_combines_goals_and_latest_chat() {
        let q = synthesize_query(&goals(), Some("what's the weather"));
        assert!(q.contains("stay useful"));
        assert!(q.contains("what's the weather"));
    }

    #[test]
    fn assemble_context_always_includes_the_safety_preamble() {
        let budget = ContextBudget {
            retrieval_count: 8,
            relevance_threshold: 0.2,
            max_context_tokens: 1,
            recent_chat_count: 10,
            recent_tool_results: 10,
        };
        let ctx = assemble_context(
            "be careful",
            &goals(),
            &[],
            &[],
            &[],
            &[],
            &budget,
        );
        assert!(ctx.contains("seven rules"));
        assert!(ctx.contains("be careful"));
    }

    #[test]
    fn trim_drops_chat_before_vector_memories() {
        let budget = ContextBudget {
            retrieval_count: 8,
            relevance_threshold: 0.2,
            max_context_tokens: 40,
            recent_chat_count: 50,
            recent_tool_results: 50,
        };
        let memories = vec![MemoryEntry::new("a load-bearing fact about the creator", "chat", 0.9)];
        let chat = vec![
            ChatMessage {
                id: 1,
                role: "creator".into(),
                content: "hello there, how is everything going today?".into(),
                timestamp: Utc::now(),
                channel: "telegram".into(),
                metadata: serde_json::json!({}),
            },
            ChatMessage {
                id: 2,
                role: "creator".into(),
                content: "also, can you check on the weekly report status?".into(),
                timestamp: Utc::now(),
                channel: "telegram".into(),
                metadata: serde_json::json!({}),
            },
        ];
        let ctx = assemble_context("be careful", &goals(), &memories, &[], &chat, &[], &budget);
        assert!(ctx.contains("load-bearing fact"));
        assert!(!ctx.contains("weekly report status"));
    }

    #[test]
    fn tool_result_summary_renders_failure_with_error_detail() {
        let summary = ToolResultSummary {
            tool: "run_shell".to_string(),
            output: ToolOutput::failed("permission denied"),
            at: Utc::now(),
        };
        let rendered = summary.render(100);
        assert!(rendered.contains("FAILED"));
        assert!(rendered.contains("permission denied"));
    }
}
