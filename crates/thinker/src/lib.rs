//! Planner LLM call and plan-parse step.
//!
//! Owns the router call at a given tier and the translation from the raw
//! JSON an LLM returns into a [`aigent_safety::Plan`] the safety validator
//! and executor can act on. Parsing is kept as a standalone pure function
//! ([`parse_raw_plan`]) so it can be exercised without a live router.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use aigent_llm::{ChatMessage, LlmRouter, Tier, extract_json_output};
use aigent_safety::{Action, Plan};
use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Default)]
pub struct MemoryConfigOverride {
    pub retrieval_count: Option<usize>,
    pub relevance_threshold: Option<f32>,
    pub decay_factor: Option<f32>,
    pub max_context_tokens: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct GoalUpdates {
    pub short_term: Option<Vec<String>>,
    pub mid_term: Option<Vec<String>>,
    pub long_term: Option<Vec<String>>,
}

/// Everything the Core Loop needs out of a successfully parsed plan
/// response, beyond the [`Plan`] itself.
#[derive(Debug, Clone)]
pub struct PlannedIteration {
    pub thinking: String,
    pub plan: Plan,
    pub goal_updates: GoalUpdates,
    pub memory_config: Option<MemoryConfigOverride>,
    pub next_sleep_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum PlanOutcome {
    Valid(PlannedIteration),
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct RawAction {
    tool: String,
    #[serde(default)]
    tier: Option<String>,
    #[serde(default)]
    parameters: serde_json::Value,
    #[serde(default)]
    halt_on_failure: bool,
}

#[derive(Debug, Deserialize, Default)]
struct RawMemoryConfig {
    retrieval_count: Option<usize>,
    relevance_threshold: Option<f32>,
    decay_factor: Option<f32>,
    max_context_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawPlanResponse {
    #[serde(default)]
    thinking: String,
    status_message: String,
    #[serde(default)]
    actions: Vec<RawAction>,
    #[serde(default)]
    chat_reply: Option<String>,
    #[serde(default)]
    short_term_goals: Option<Vec<String>>,
    #[serde(default)]
    mid_term_goals: Option<Vec<String>>,
    #[serde(default)]
    long_term_goals: Option<Vec<String>>,
    #[serde(default)]
    memory_config: Option<RawMemoryConfig>,
    #[serde(default)]
    next_sleep_seconds: Option<f64>,
}

fn parameters_to_args(parameters: &serde_json::Value) -> HashMap<String, String> {
    let mut args = HashMap::new();
    if let Some(map) = parameters.as_object() {
        for (key, value) in map {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            args.insert(key.clone(), rendered);
        }
    }
    args
}

/// Parse an LLM response's embedded JSON into a [`PlannedIteration`].
/// Returns `None` on anything that doesn't at least carry a
/// `status_message` — callers treat that as an invalid-plan outcome for
/// this iteration, not a fatal error.
pub fn parse_raw_plan(response_text: &str) -> Option<PlannedIteration> {
    let raw: RawPlanResponse = extract_json_output(response_text)?;

    let actions = raw
        .actions
        .into_iter()
        .map(|a| Action::ToolCall {
            tool: a.tool,
            tier: a.tier,
            args: parameters_to_args(&a.parameters),
            halt_on_failure: a.halt_on_failure,
        })
        .collect();

    let plan = Plan {
        status_message: raw.status_message,
        actions,
        chat_reply: raw.chat_reply,
        creator_authenticated: false,
    };

    let memory_config = raw.memory_config.map(|m| MemoryConfigOverride {
        retrieval_count: m.retrieval_count,
        relevance_threshold: m.relevance_threshold,
        decay_factor: m.decay_factor,
        max_context_tokens: m.max_context_tokens,
    });

    Some(PlannedIteration {
        thinking: raw.thinking,
        plan,
        goal_updates: GoalUpdates {
            short_term: raw.short_term_goals,
            mid_term: raw.mid_term_goals,
            long_term: raw.long_term_goals,
        },
        memory_config,
        next_sleep_seconds: raw.next_sleep_seconds.map(|s| s.max(0.0) as u64),
    })
}

/// Calls the router at a tier and parses the result into a plan outcome,
/// tracking consecutive parse failures so the Core Loop can force a tier
/// downgrade after three in a row (reset on any successful parse).
pub struct Thinker {
    router: Arc<LlmRouter>,
    consecutive_invalid: AtomicU32,
}

const CONSECUTIVE_INVALID_DOWNGRADE_THRESHOLD: u32 = 3;

impl Thinker {
    pub fn new(router: Arc<LlmRouter>) -> Self {
        Self { router, consecutive_invalid: AtomicU32::new(0) }
    }

    pub async fn think(&self, tier: Tier, context: &str) -> Result<PlanOutcome> {
        let messages = vec![
            ChatMessage::system(context),
            ChatMessage::user(
                "Produce the next plan as a single JSON object matching the agreed schema.",
            ),
        ];
        let response = self.router.chat(tier, &messages, None).await?;

        match parse_raw_plan(&response.content) {
            Some(planned) => {
                self.consecutive_invalid.store(0, Ordering::SeqCst);
                Ok(PlanOutcome::Valid(planned))
            }
            None => {
                self.consecutive_invalid.fetch_add(1, Ordering::SeqCst);
                let preview: String = response.content.chars().take(200).collect();
                Ok(PlanOutcome::Invalid(format!(
                    "could not parse a plan from the model response: {preview}"
                )))
            }
        }
    }

    pub fn consecutive_invalid(&self) -> u32 {
        self.consecutive_invalid.load(Ordering::SeqCst)
    }

    pub fn should_force_downgrade(&self) -> bool {
        self.consecutive_invalid.load(Ordering::SeqCst) >= CONSECUTIVE_INVALID_DOWNGRADE_THRESHOLD
    }

    pub fn reset_invalid_counter(&self) {
        self.consecutive_invalid.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_valid_plan() {
        let raw = r#"```json
{"status_message": "idle", "actions": []}
```"#;
        let planned = parse_raw_plan(raw).unwrap();
        assert_eq!(planned.plan.status_message, "idle");
        assert!(planned.plan.actions.is_empty());
    }

    #[test]
    fn parses_tool_action_with_string_parameters() {
        let raw = r#"{"status_message": "searching", "actions": [
            {"tool": "web_search", "parameters": {"query": "rust async"}}
        ]}"#;
        let planned = parse_raw_plan(raw).unwrap();
        assert_eq!(planned.plan.actions.len(), 1);
        match &planned.plan.actions[0] {
            Action::ToolCall { tool, args, .. } => {
                assert_eq!(tool, "web_search");
                assert_eq!(args.get("query").unwrap(), "rust async");
            }
            _ => panic!("expected a tool call"),
        }
    }

    #[test]
    fn parses_numeric_parameter_as_stringified_value() {
        let raw = r#"{"status_message": "scheduling", "actions": [
            {"tool": "calendar_add_event", "parameters": {"title": "sync", "attendees": 3}}
        ]}"#;
        let planned = parse_raw_plan(raw).unwrap();
        match &planned.plan.actions[0] {
            Action::ToolCall { args, .. } => assert_eq!(args.get("attendees").unwrap(), "3"),
            _ => panic!("expected a tool call"),
        }
    }

    #[test]
    fn parses_goal_updates_and_memory_config_and_sleep() {
        let raw = r#"{
            "status_message": "updating goals",
            "actions": [],
            "short_term_goals": ["reply to email"],
            "memory_config": {"retrieval_count": 12, "relevance_threshold": 0.4},
            "next_sleep_seconds": 45.7
        }"#;
        let planned = parse_raw_plan(raw).unwrap();
        assert_eq!(planned.goal_updates.short_term, Some(vec!["reply to email".to_string()]));
        let mem = planned.memory_config.unwrap();
        assert_eq!(mem.retrieval_count, Some(12));
        assert_eq!(mem.relevance_threshold, Some(0.4));
        assert_eq!(planned.next_sleep_seconds, Some(45));
    }

    #[test]
    fn missing_status_message_fails_to_parse() {
        let raw = r#"{"actions": []}"#;
        assert!(parse_raw_plan(raw).is_none());
    }

    #[test]
    fn plain_text_response_fails_to_parse() {
        assert!(parse_raw_plan("I think we should just wait and see.").is_none());
    }

    #[test]
    fn halt_on_failure_defaults_false_and_is_picked_up_when_set() {
        let raw = r#"{"status_message": "x", "actions": [
            {"tool": "run_shell", "parameters": {"command": "ls"}, "halt_on_failure": true}
        ]}"#;
        let planned = parse_raw_plan(raw).unwrap();
        match &planned.plan.actions[0] {
            Action::ToolCall { halt_on_failure, .. } => assert!(halt_on_failure),
            _ => panic!("expected a tool call"),
        }
    }
}
