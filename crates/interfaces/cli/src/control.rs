//! Operator commands that read or mutate the on-disk State Store / Budget
//! Tracker / Blob Log directly, per `SPEC_FULL.md`'s note that the real
//! HTTP surface (§6) is the dashboard's job and stays a sketch — these are
//! the CLI stand-in for it. Safe to run whether or not a daemon currently
//! holds the data directory: reads are always consistent (each load is a
//! point-in-time snapshot of a JSON file), and writes use the same
//! write-then-rename each component's own library uses. A write issued
//! while a daemon is running only takes effect on that daemon's *next*
//! restart — there is no live IPC channel into a running core loop, short
//! of the stdin REPL attached to `aigent run` (see `interactive.rs`).

use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;

use aigent_blob::BlobLog;
use aigent_budget::BudgetTracker;
use aigent_config::AppConfig;
use aigent_selfupdate::SelfUpdateManager;
use aigent_state::StateStore;

fn data_dir(config: &AppConfig) -> PathBuf {
    PathBuf::from(&config.agent.data_dir)
}

async fn open_state(config: &AppConfig) -> Result<StateStore> {
    StateStore::load(data_dir(config).join("state.json")).await
}

fn open_budget(config: &AppConfig) -> Result<BudgetTracker> {
    BudgetTracker::load(config, data_dir(config).join("budget.json"))
}

pub(crate) async fn status(config: &AppConfig) -> Result<()> {
    let state = open_state(config).await?;
    let snapshot = state.snapshot().await;
    let budget = open_budget(config)?.snapshot();

    println!("directive      : {}", snapshot.directive);
    println!("iteration      : {}", snapshot.iteration);
    println!("paused         : {}", snapshot.paused);
    println!("active_task    : {}", snapshot.active_task.as_deref().unwrap_or("(none)"));
    println!("chat_cursor    : {}", snapshot.chat_cursor);
    println!(
        "goals.long     : {}",
        if snapshot.goals.long_term.is_empty() { "(none)".into() } else { snapshot.goals.long_term.join("; ") }
    );
    println!(
        "goals.medium   : {}",
        if snapshot.goals.medium_term.is_empty() { "(none)".into() } else { snapshot.goals.medium_term.join("; ") }
    );
    println!(
        "goals.short    : {}",
        if snapshot.goals.short_term.is_empty() { "(none)".into() } else { snapshot.goals.short_term.join("; ") }
    );
    println!(
        "budget         : ${:.2} / ${:.2} spent this month",
        budget.spent_this_month_usd, budget.monthly_cap_usd
    );
    Ok(())
}

pub(crate) async fn set_paused(config: &AppConfig, paused: bool) -> Result<()> {
    let state = open_state(config).await?;
    state.set_paused(paused).await;
    state.save().await?;
    println!("paused = {paused}");
    Ok(())
}

pub(crate) async fn directive_show(config: &AppConfig) -> Result<()> {
    let state = open_state(config).await?;
    println!("{}", state.directive().await);
    Ok(())
}

pub(crate) async fn directive_set(config: &AppConfig, text: String) -> Result<()> {
    let state = open_state(config).await?;
    state.set_directive(text).await;
    state.save().await?;
    println!("directive updated");
    Ok(())
}

#[derive(Clone, Copy, clap::ValueEnum, Debug)]
pub(crate) enum GoalTier {
    Short,
    Medium,
    Long,
}

pub(crate) async fn goals_show(config: &AppConfig) -> Result<()> {
    let state = open_state(config).await?;
    let goals = state.goals().await;
    println!("short : {:?}", goals.short_term);
    println!("medium: {:?}", goals.medium_term);
    println!("long  : {:?}", goals.long_term);
    Ok(())
}

pub(crate) async fn goals_set(config: &AppConfig, tier: GoalTier, items: Vec<String>) -> Result<()> {
    let state = open_state(config).await?;
    let mut goals = state.goals().await;
    match tier {
        GoalTier::Short => goals.short_term = items,
        GoalTier::Medium => goals.medium_term = items,
        GoalTier::Long => goals.long_term = items,
    }
    state.set_goals(goals).await;
    state.save().await?;
    println!("goals updated");
    Ok(())
}

pub(crate) fn budget_show(config: &AppConfig) -> Result<()> {
    let budget = open_budget(config)?.snapshot();
    println!("monthly_cap_usd      : {:.2}", budget.monthly_cap_usd);
    println!("spent_this_month_usd : {:.2}", budget.spent_this_month_usd);
    println!("month                : {}", budget.month);
    println!("{:<20} {:<8} {:<10} {:>12} {:>14}", "provider", "tier", "currency", "spent", "known_balance");
    for provider in &budget.providers {
        println!(
            "{:<20} {:<8} {:<10} {:>12.4} {:>14}",
            provider.name,
            provider.tier,
            provider.currency,
            provider.spent_tracked,
            provider.known_balance.map(|b| format!("{b:.2}")).unwrap_or_else(|| "—".to_string())
        );
    }
    Ok(())
}

/// `aigent budget override-cap` — §4.6 rule 7: the only path by which the
/// monthly cap changes is this authenticated creator-operated command; the
/// planner's plan schema has no field that reaches `BudgetTracker::
/// override_monthly_cap`.
pub(crate) fn budget_override_cap(config: &AppConfig, new_cap_usd: f64) -> Result<()> {
    let tracker = open_budget(config)?;
    tracker.override_monthly_cap(new_cap_usd);
    tracker.save()?;
    println!("monthly cap overridden to ${new_cap_usd:.2}");
    Ok(())
}

pub(crate) fn budget_set_balance(config: &AppConfig, provider: &str, balance: f64) -> Result<()> {
    let tracker = open_budget(config)?;
    tracker.set_known_balance(provider, balance)?;
    tracker.save()?;
    println!("{provider} known_balance set to {balance:.2}");
    Ok(())
}

pub(crate) fn providers_list(config: &AppConfig) {
    let ladders: &[(&str, &Vec<aigent_config::ProviderConfig>)] = &[
        ("level1", &config.llm.level1),
        ("level2", &config.llm.level2),
        ("level3", &config.llm.level3),
        ("coding_level1", &config.llm.coding_level1),
        ("coding_level2", &config.llm.coding_level2),
        ("coding_level3", &config.llm.coding_level3),
    ];
    for (tier, providers) in ladders {
        for provider in providers.iter() {
            let key_present = if provider.api_key_env.is_empty() {
                "n/a".to_string()
            } else {
                let set = std::env::var(&provider.api_key_env).is_ok();
                format!("{} ({})", provider.api_key_env, if set { "set" } else { "missing" })
            };
            println!(
                "{tier:<14} {:<20} model={:<30} currency={:<8} key={key_present}",
                provider.name, provider.model, provider.currency
            );
        }
    }
}

pub(crate) async fn blob_tail(config: &AppConfig, n: usize) -> Result<()> {
    let log = BlobLog::new(data_dir(config).join("blob"));
    for event in log.tail(n).await? {
        println!("[{}] {:?} {}", event.timestamp.to_rfc3339(), event.event_type, event.content);
    }
    Ok(())
}

pub(crate) async fn blob_date(config: &AppConfig, date: NaiveDate) -> Result<()> {
    let log = BlobLog::new(data_dir(config).join("blob"));
    for event in log.read_events_for(date).await? {
        println!("[{}] {:?} {}", event.timestamp.to_rfc3339(), event.event_type, event.content);
    }
    Ok(())
}

pub(crate) async fn chat_send(config: &AppConfig, message: String, channel: String) -> Result<()> {
    let state = open_state(config).await?;
    let id = state.append_chat("creator", message, channel, serde_json::json!({})).await;
    state.save().await?;
    println!(
        "chat message {id} enqueued; it is picked up by the running daemon's next load, \
         or on its next restart — use `aigent run` interactively for a synchronous reply"
    );
    Ok(())
}

pub(crate) fn self_update_status(config: &AppConfig, config_path: &std::path::Path) -> Result<()> {
    let live_dir = config_path.parent().unwrap_or_else(|| std::path::Path::new(".")).to_path_buf();
    let manager = SelfUpdateManager::new(
        live_dir,
        data_dir(config),
        config.safety.self_update_allowlist.clone(),
    );
    let status = manager.status();
    println!("backup_dir   : {}", status.backup_dir.display());
    println!("image_hash   : {}", status.image_hash.as_deref().unwrap_or("(none — never booted)"));
    println!("needs_revert : {}", status.needs_revert);
    println!("healthy      : {}", status.healthy);
    Ok(())
}

