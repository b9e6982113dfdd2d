//! Core Loop: plan, execute, remember (§4.1).
//!
//! [`CoreLoop`] owns every long-lived component (state, blob log, memory,
//! budget, router, planner, safety, executor, tool registry) and drives the
//! eleven-step iteration. Wake-up and shutdown are external signals — a
//! `tokio::sync::Notify` the CLI/listeners can fire to cut a sleep short, and
//! a `tokio_util::sync::CancellationToken` for an orderly stop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aigent_blob::{BlobEvent, BlobEventType, BlobLog};
use aigent_config::{AppConfig, ApprovalMode};
use aigent_exec::{ExecutionPolicy, ToolExecutor};
use aigent_llm::{LlmRouter, Tier};
use aigent_memory::MemoryManager;
use aigent_prompt::{ContextBudget, ToolResultSummary};
use aigent_safety::SafetyRules;
use aigent_state::{Goals, MemoryOverrides, StateStore};
use aigent_thinker::{GoalUpdates, MemoryConfigOverride, PlanOutcome, Thinker};
use aigent_tools::ToolRegistry;
use anyhow::Result;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Every-10th-iteration maintenance cadence, per §4.1.
const MAINTENANCE_EVERY_N_ITERATIONS: u64 = 10;

/// How many undelivered chat messages the loop drains in one iteration
/// (step 2). A bound, not a queue depth limit — anything past it waits for
/// the next iteration.
const MAX_CHAT_DRAIN: usize = 16;

/// Bound on the in-memory tool-result history carried between iterations
/// for context assembly (step 5 reads from this, never from disk).
const TOOL_RESULT_HISTORY_CAP: usize = 64;

/// A narrow summary of one completed iteration, broadcast for any
/// subscriber (a dashboard, a CLI `status` command) to observe. The
/// dashboard itself is out of scope; this is the seam it would attach to.
#[derive(Debug, Clone)]
pub struct IterationSummary {
    pub iteration: u64,
    pub status_message: String,
    pub actions_run: usize,
    pub violations: usize,
    pub chat_reply_delivered: bool,
}

fn effective_context_budget(config: &aigent_config::MemoryConfig, overrides: &MemoryOverrides) -> ContextBudget {
    ContextBudget {
        retrieval_count: overrides.retrieval_count.unwrap_or(config.retrieval_count),
        relevance_threshold: overrides.relevance_threshold.unwrap_or(config.relevance_threshold),
        max_context_tokens: overrides.max_context_tokens.unwrap_or(config.max_context_tokens),
        recent_chat_count: MAX_CHAT_DRAIN,
        recent_tool_results: 16,
    }
}

fn merge_memory_overrides(existing: &MemoryOverrides, update: &MemoryConfigOverride) -> MemoryOverrides {
    MemoryOverrides {
        retrieval_count: update.retrieval_count.or(existing.retrieval_count),
        relevance_threshold: update.relevance_threshold.or(existing.relevance_threshold),
        decay_factor: update.decay_factor.or(existing.decay_factor),
        max_context_tokens: update.max_context_tokens.or(existing.max_context_tokens),
    }
}

/// Bridges `thinker::GoalUpdates` (`mid_term`) onto `state::Goals`
/// (`medium_term`) — the two types are independently owned (the planner's
/// wire schema vs. the durable state shape) and happen to disagree on this
/// one field's name.
fn merge_goals(existing: &Goals, update: &GoalUpdates) -> Goals {
    Goals {
        long_term: update.long_term.clone().unwrap_or_else(|| existing.long_term.clone()),
        medium_term: update.mid_term.clone().unwrap_or_else(|| existing.medium_term.clone()),
        short_term: update.short_term.clone().unwrap_or_else(|| existing.short_term.clone()),
    }
}

pub struct CoreLoop {
    config: AppConfig,
    state: Arc<StateStore>,
    blob: Arc<BlobLog>,
    memory: Arc<MemoryManager>,
    budget: Arc<aigent_budget::BudgetTracker>,
    thinker: Thinker,
    safety: SafetyRules,
    executor: ToolExecutor,
    registry: ToolRegistry,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    tool_history: Vec<ToolResultSummary>,
    summaries: tokio::sync::broadcast::Sender<IterationSummary>,
}

impl CoreLoop {
    /// Wire every component from config and load durable state from disk.
    /// Returns the loop itself plus the handles external callers (CLI,
    /// listeners) need: the shared state store, the wake signal, the
    /// shutdown token, and a receiver for iteration summaries.
    pub async fn bootstrap(
        config: AppConfig,
    ) -> Result<(Self, Arc<StateStore>, Arc<Notify>, CancellationToken, tokio::sync::broadcast::Receiver<IterationSummary>)> {
        let data_dir = PathBuf::from(&config.agent.data_dir);

        let state = Arc::new(StateStore::load(data_dir.join("state.json")).await?);
        if state.directive().await.is_empty() {
            state.set_directive(config.agent.directive.clone()).await;
        }

        let blob = Arc::new(BlobLog::new(data_dir.join("blob")));
        let memory = Arc::new(MemoryManager::from_config(&config.memory));
        let budget = Arc::new(aigent_budget::BudgetTracker::load(&config, data_dir.join("budget.json"))?);
        let router = Arc::new(LlmRouter::from_config(&config, budget.clone()));
        let thinker = Thinker::new(router);
        let safety = SafetyRules::frozen();

        // The core loop runs planner-issued actions straight through, with no
        // interactive approval channel wired up — §4.6's safety validation is
        // the only gate an autonomous iteration gets. Forcing `Autonomous`
        // here (regardless of what an operator configured for other
        // entrypoints) keeps `requires_approval` from auto-denying every
        // write/shell action against a `None` approval channel.
        let mut policy = ExecutionPolicy::from_config(&config);
        policy.approval_mode = ApprovalMode::Autonomous;
        policy.approval_required = false;
        let executor = ToolExecutor::new(policy);

        let workspace_root = PathBuf::from(&config.agent.workspace_path);
        let registry = aigent_exec::default_registry(workspace_root, data_dir.clone()).await;

        let wake = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();
        let (summaries_tx, summaries_rx) = tokio::sync::broadcast::channel(32);

        blob.append(&BlobEvent::new(BlobEventType::System, "agent booting")).await?;

        let core = Self {
            config,
            state: state.clone(),
            blob,
            memory,
            budget,
            thinker,
            safety,
            executor,
            registry,
            wake: wake.clone(),
            shutdown: shutdown.clone(),
            tool_history: Vec::new(),
            summaries: summaries_tx,
        };

        Ok((core, state, wake, shutdown, summaries_rx))
    }

    /// Drive iterations until `shutdown` fires. A pause check only happens
    /// at the top of the loop, per §4.1 — a paused agent never interrupts an
    /// iteration already in flight.
    pub async fn run(mut self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if self.state.is_paused().await {
                self.sleep_or_wake(Duration::from_secs(self.config.sleep.max_sleep_secs)).await;
                continue;
            }

            let sleep_secs = match self.run_iteration().await {
                Ok(secs) => secs,
                Err(err) => {
                    tracing::error!(error = %err, "iteration failed");
                    let _ = self
                        .blob
                        .append(&BlobEvent::new(BlobEventType::Error, format!("iteration failed: {err}")))
                        .await;
                    self.config.sleep.active_sleep_secs
                }
            };

            self.sleep_or_wake(Duration::from_secs(sleep_secs)).await;
        }

        self.state.save().await?;
        self.budget.save()?;
        Ok(())
    }

    async fn sleep_or_wake(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// One pass of the eleven-step algorithm. Returns the number of seconds
    /// the loop should sleep before the next iteration.
    async fn run_iteration(&mut self) -> Result<u64> {
        // Step 1: load state (already resident; just snapshot what this
        // iteration needs).
        let directive = self.state.directive().await;
        let goals = self.state.goals().await;
        let overrides = self.state.memory_overrides().await;

        // Step 2: drain up to MAX_CHAT_DRAIN undelivered chat messages.
        let mut unread = self.state.drain_unread().await;
        unread.truncate(MAX_CHAT_DRAIN);
        for message in &unread {
            let event = BlobEvent::new(BlobEventType::ChatCreator, message.content.clone())
                .with_metadata(serde_json::json!({ "channel": message.channel, "role": message.role }));
            self.blob.append(&event).await?;
        }
        let latest_channel = unread.last().map(|m| m.channel.clone());

        // Step 3: build the working context.
        let context_budget = effective_context_budget(&self.config.memory, &overrides);
        let query = aigent_prompt::synthesize_query(&goals, unread.last().map(|m| m.content.as_str()));
        let vector_memories = self.memory.retrieve(&query, context_budget.retrieval_count, context_budget.relevance_threshold);
        let short_term_notes: Vec<String> = self
            .memory
            .recent_short_term_notes(context_budget.retrieval_count.max(8))
            .into_iter()
            .rev()
            .map(|note| note.content)
            .collect();
        let context = aigent_prompt::assemble_context(
            &directive,
            &goals,
            &vector_memories,
            &short_term_notes,
            &unread,
            &self.tool_history,
            &context_budget,
        );

        // Step 4: plan, via the router at the planner's current tier. Forced
        // down a tier once the thinker has seen three consecutive
        // unparseable responses.
        let tier = if self.thinker.should_force_downgrade() {
            Tier::Level1.degrade().unwrap_or(Tier::Level1)
        } else {
            Tier::Level1
        };
        self.blob
            .append(&BlobEvent::new(BlobEventType::LlmRequest, aigent_memory::truncate_str(&context, 4000)))
            .await?;
        let outcome = self.thinker.think(tier, &context).await?;

        let planned = match outcome {
            PlanOutcome::Valid(planned) => planned,
            PlanOutcome::Invalid(reason) => {
                self.blob.append(&BlobEvent::new(BlobEventType::Error, reason.clone())).await?;
                self.memory.push_short_term_note(format!("planning failed: {reason}"), self.state.iteration().await);
                return Ok(self.config.sleep.active_sleep_secs);
            }
        };
        self.thinker.reset_invalid_counter();
        self.blob
            .append(&BlobEvent::new(
                BlobEventType::LlmResponse,
                format!("{}\n{}", planned.thinking, planned.plan.status_message),
            ))
            .await?;

        // Step 5 (validation, per §4.6): the plan never reaches the
        // executor unvalidated.
        let report = self.safety.validate_plan(&planned.plan, &self.blob).await?;
        self.blob
            .append(&BlobEvent::new(
                BlobEventType::Planning,
                format!(
                    "iteration plan: {} actions allowed, {} violations",
                    report.allowed_actions.len(),
                    report.violations.len()
                ),
            ))
            .await?;

        // Step 6: execute the validated actions sequentially, timeout-bounded,
        // halting early on a halt_on_failure failure.
        let results = self.executor.run_plan(&self.registry, &report.allowed_actions).await;
        let now = chrono::Utc::now();
        for result in &results {
            let (redacted_output, _found) = self.safety.redact_credentials(&result.output.output);
            self.blob
                .append(&BlobEvent::new(BlobEventType::ToolCall, result.tool.clone()))
                .await?;
            self.blob
                .append(
                    &BlobEvent::new(BlobEventType::ToolResult, redacted_output.clone())
                        .with_metadata(serde_json::json!({ "tool": result.tool, "success": result.output.success })),
                )
                .await?;

            if result.output.success && !redacted_output.trim().is_empty() {
                let entry = aigent_memory::MemoryEntry::new(
                    format!("{}: {}", result.tool, aigent_memory::truncate_str(&redacted_output, 2000)),
                    format!("tool:{}", result.tool),
                    0.4,
                );
                self.memory.insert(entry);
            }

            self.tool_history.push(ToolResultSummary {
                tool: result.tool.clone(),
                output: aigent_tools::ToolOutput {
                    success: result.output.success,
                    output: redacted_output,
                    error: result.output.error.clone(),
                    meta: result.output.meta.clone(),
                },
                at: now,
            });
        }
        while self.tool_history.len() > TOOL_RESULT_HISTORY_CAP {
            self.tool_history.remove(0);
        }

        self.memory.push_short_term_note(planned.plan.status_message.clone(), self.state.iteration().await);

        // Step 7: update state — goals, memory overrides, active task.
        let merged_goals = merge_goals(&goals, &planned.goal_updates);
        self.state.set_goals(merged_goals).await;
        if let Some(memory_config) = &planned.memory_config {
            self.state.set_memory_overrides(merge_memory_overrides(&overrides, memory_config)).await;
        }
        let active_task = results.last().map(|r| r.tool.clone());
        self.state.set_active_task(active_task).await;
        let iteration = self.state.advance_iteration().await;

        // Step 8: deliver the chat reply, if any, on the channel of the
        // most recently drained message (falling back to "system").
        let mut chat_reply_delivered = false;
        if let Some(reply) = &planned.plan.chat_reply {
            let channel = latest_channel.clone().unwrap_or_else(|| "system".to_string());
            self.state.append_chat("jarvis", reply.clone(), channel, serde_json::json!({})).await;
            self.blob.append(&BlobEvent::new(BlobEventType::ChatJarvis, reply.clone())).await?;
            chat_reply_delivered = true;
        }

        // Step 9: broadcast the iteration summary. No subscriber is
        // required — the dashboard this feeds is out of scope here.
        let _ = self.summaries.send(IterationSummary {
            iteration,
            status_message: planned.plan.status_message.clone(),
            actions_run: results.len(),
            violations: report.violations.len(),
            chat_reply_delivered,
        });

        self.state.save().await?;
        self.budget.save()?;

        // Step 10: maintenance sweep every Nth iteration.
        if iteration % MAINTENANCE_EVERY_N_ITERATIONS == 0 {
            let removed = self.memory.run_maintenance();
            tracing::info!(iteration, removed, "ran memory maintenance sweep");
        }

        // Step 11: adaptive sleep — shorter when an action just ran or chat
        // is waiting, longer when idle.
        let next_sleep = planned.next_sleep_seconds.unwrap_or_else(|| {
            if !results.is_empty() || !unread.is_empty() {
                self.config.sleep.active_sleep_secs
            } else {
                self.config.sleep.max_sleep_secs
            }
        });
        Ok(next_sleep.clamp(self.config.sleep.min_sleep_secs, self.config.sleep.max_sleep_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigent_state::Goals as StateGoals;

    #[test]
    fn merge_goals_bridges_mid_term_to_medium_term() {
        let existing = StateGoals { long_term: vec!["a".into()], medium_term: vec!["b".into()], short_term: vec!["c".into()] };
        let update = GoalUpdates { short_term: None, mid_term: Some(vec!["updated".into()]), long_term: None };
        let merged = merge_goals(&existing, &update);
        assert_eq!(merged.medium_term, vec!["updated".to_string()]);
        assert_eq!(merged.long_term, vec!["a".to_string()]);
        assert_eq!(merged.short_term, vec!["c".to_string()]);
    }

    #[test]
    fn merge_memory_overrides_keeps_existing_fields_when_update_leaves_them_unset() {
        let existing = MemoryOverrides { retrieval_count: Some(10), relevance_threshold: None, decay_factor: Some(0.9), max_context_tokens: None };
        let update = MemoryConfigOverride { retrieval_count: None, relevance_threshold: Some(0.3), decay_factor: None, max_context_tokens: Some(4000) };
        let merged = merge_memory_overrides(&existing, &update);
        assert_eq!(merged.retrieval_count, Some(10));
        assert_eq!(merged.relevance_threshold, Some(0.3));
        assert_eq!(merged.decay_factor, Some(0.9));
        assert_eq!(merged.max_context_tokens, Some(4000));
    }

    #[test]
    fn effective_context_budget_falls_back_to_config_defaults() {
        let config = aigent_config::MemoryConfig::default();
        let overrides = MemoryOverrides::default();
        let budget = effective_context_budget(&config, &overrides);
        assert_eq!(budget.retrieval_count, config.retrieval_count);
        assert_eq!(budget.max_context_tokens, config.max_context_tokens);
    }
}
