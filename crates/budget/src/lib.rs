//! Budget Tracker: per-provider balance/spend accounting and the monthly
//! cap that gates which tiers the LLM router may still reach for.
//!
//! All mutation goes through [`BudgetTracker::charge`] (or the narrower
//! [`BudgetTracker::reset_month`] / [`BudgetTracker::set_known_balance`]),
//! each of which takes the single internal mutex for its whole duration so
//! concurrent callers never interleave a read-estimate with a write-charge.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aigent_config::{AppConfig, ProviderConfig};
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Currencies the monthly cap aggregates over. Anything else (API credits,
/// bare request counts) is tracked per-provider only — there is no shared
/// cap to measure them against.
fn is_monetary(currency: &str) -> bool {
    matches!(currency.to_ascii_uppercase().as_str(), "USD" | "EUR" | "GBP")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub name: String,
    pub tier: String,
    pub currency: String,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub known_balance: Option<f64>,
    pub spent_tracked: f64,
}

impl ProviderRecord {
    fn from_config(tier: &str, provider: &ProviderConfig) -> Self {
        Self {
            name: provider.name.clone(),
            tier: tier.to_string(),
            currency: provider.currency.clone(),
            input_per_1k: provider.input_per_1k,
            output_per_1k: provider.output_per_1k,
            known_balance: provider.known_balance,
            spent_tracked: 0.0,
        }
    }

    fn estimate(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub monthly_cap_usd: f64,
    pub spent_this_month_usd: f64,
    pub month: NaiveDate,
    pub providers: Vec<ProviderRecord>,
}

impl BudgetState {
    fn from_config(config: &AppConfig) -> Self {
        let mut providers = Vec::new();
        let ladders: &[(&str, &Vec<ProviderConfig>)] = &[
            ("level1", &config.llm.level1),
            ("level2", &config.llm.level2),
            ("level3", &config.llm.level3),
            ("coding_level1", &config.llm.coding_level1),
            ("coding_level2", &config.llm.coding_level2),
            ("coding_level3", &config.llm.coding_level3),
        ];
        for (tier, list) in ladders {
            for provider in list.iter() {
                if !providers.iter().any(|p: &ProviderRecord| p.name == provider.name) {
                    providers.push(ProviderRecord::from_config(tier, provider));
                }
            }
        }

        Self {
            monthly_cap_usd: config.budget.monthly_cap_usd,
            spent_this_month_usd: 0.0,
            month: Utc::now().date_naive().with_day(1).expect("day 1 always valid"),
            providers,
        }
    }
}

/// Result of a [`BudgetTracker::charge`] call, per §4.3's `charge →
/// ok | over_cap` contract. Either variant carries the amount actually
/// charged (in the provider's currency) — the charge itself always lands;
/// `OverCap` only tells the caller the monthly cap no longer holds so it
/// can react (degrade tiers, warn an operator), not that the spend was
/// refused.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChargeOutcome {
    Ok(f64),
    OverCap(f64),
}

impl ChargeOutcome {
    pub fn cost(self) -> f64 {
        match self {
            ChargeOutcome::Ok(cost) | ChargeOutcome::OverCap(cost) => cost,
        }
    }

    pub fn is_over_cap(self) -> bool {
        matches!(self, ChargeOutcome::OverCap(_))
    }
}

pub struct BudgetTracker {
    path: Option<PathBuf>,
    state: Mutex<BudgetState>,
}

impl BudgetTracker {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            path: None,
            state: Mutex::new(BudgetState::from_config(config)),
        }
    }

    pub fn load(config: &AppConfig, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parsing budget state at {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BudgetState::from_config(config),
            Err(err) => return Err(err).context("reading budget state"),
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let snapshot = self.state.lock().expect("budget mutex poisoned");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = serde_json::to_string_pretty(&*snapshot)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, rendered)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn snapshot(&self) -> BudgetState {
        self.state.lock().expect("budget mutex poisoned").clone()
    }

    /// Estimated cost of a call to `provider_name`, in that provider's
    /// currency. Zero for an unknown provider (callers should treat that as
    /// "can't estimate" rather than "free").
    pub fn estimate(&self, provider_name: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let state = self.state.lock().expect("budget mutex poisoned");
        state
            .providers
            .iter()
            .find(|p| p.name == provider_name)
            .map(|p| p.estimate(input_tokens, output_tokens))
            .unwrap_or(0.0)
    }

    /// Whether charging `estimated_cost` against `provider_name` would stay
    /// within the monthly cap. Non-monetary providers (credits, bare
    /// request counts) always return `true` — there is no cross-provider
    /// cap to check them against.
    pub fn can_afford(&self, provider_name: &str, estimated_cost: f64) -> bool {
        let state = self.state.lock().expect("budget mutex poisoned");
        let Some(provider) = state.providers.iter().find(|p| p.name == provider_name) else {
            return true;
        };
        if !is_monetary(&provider.currency) {
            return true;
        }
        state.spent_this_month_usd + estimated_cost <= state.monthly_cap_usd
    }

    /// Record an actual spend against `provider_name`. Rolls the monthly
    /// counters over first if the wall-clock month has advanced since the
    /// last charge. The charge is applied unconditionally (the call already
    /// happened; tokens were already spent) — the returned
    /// [`ChargeOutcome`] only distinguishes whether this charge left the
    /// monthly cap intact (`Ok`) or pushed spend past it (`OverCap`), for
    /// monetary currencies. Non-monetary currencies never go `OverCap`
    /// here; `can_afford`/the router's pre-call gate is what keeps those
    /// bounded.
    pub fn charge(&self, provider_name: &str, input_tokens: u64, output_tokens: u64) -> Result<ChargeOutcome> {
        let mut state = self.state.lock().expect("budget mutex poisoned");
        roll_month_if_needed(&mut state);

        let provider = state
            .providers
            .iter_mut()
            .find(|p| p.name == provider_name)
            .with_context(|| format!("unknown budget provider: {provider_name}"))?;

        let cost = provider.estimate(input_tokens, output_tokens);
        provider.spent_tracked += cost;
        if let Some(balance) = provider.known_balance.as_mut() {
            *balance -= cost;
        }
        let monetary = is_monetary(&provider.currency);
        let mut over_cap = false;
        if monetary {
            state.spent_this_month_usd += cost;
            over_cap = state.spent_this_month_usd > state.monthly_cap_usd;
        }
        Ok(if over_cap { ChargeOutcome::OverCap(cost) } else { ChargeOutcome::Ok(cost) })
    }

    pub fn reset_month(&self) {
        let mut state = self.state.lock().expect("budget mutex poisoned");
        state.spent_this_month_usd = 0.0;
        state.month = Utc::now().date_naive().with_day(1).expect("day 1 always valid");
        for provider in state.providers.iter_mut() {
            provider.spent_tracked = 0.0;
        }
    }

    pub fn set_known_balance(&self, provider_name: &str, balance: f64) -> Result<()> {
        let mut state = self.state.lock().expect("budget mutex poisoned");
        let provider = state
            .providers
            .iter_mut()
            .find(|p| p.name == provider_name)
            .with_context(|| format!("unknown budget provider: {provider_name}"))?;
        provider.known_balance = Some(balance);
        Ok(())
    }

    /// Replace the monthly cap outright. Per §4.6 rule 7 this must only be
    /// reachable through the authenticated creator path (the CLI operator
    /// surface) — the planner has no action that calls this, only
    /// `set_known_balance`/`charge`/`estimate` are reachable from plan
    /// execution.
    pub fn override_monthly_cap(&self, new_cap_usd: f64) {
        let mut state = self.state.lock().expect("budget mutex poisoned");
        state.monthly_cap_usd = new_cap_usd;
    }
}

fn roll_month_if_needed(state: &mut BudgetState) {
    let current_month = Utc::now().date_naive().with_day(1).expect("day 1 always valid");
    if current_month != state.month {
        state.month = current_month;
        state.spent_this_month_usd = 0.0;
        for provider in state.providers.iter_mut() {
            provider.spent_tracked = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigent_config::AppConfig;

    #[test]
    fn estimate_matches_configured_per_1k_rates() {
        let config = AppConfig::default();
        let tracker = BudgetTracker::new(&config);
        let cost = tracker.estimate("openrouter", 1000, 1000);
        assert!((cost - (3.0 + 15.0)).abs() < 1e-9);
    }

    #[test]
    fn charge_accumulates_spent_and_respects_monthly_cap() {
        let mut config = AppConfig::default();
        config.budget.monthly_cap_usd = 10.0;
        let tracker = BudgetTracker::new(&config);

        assert!(tracker.can_afford("openrouter", 5.0));
        tracker.charge("openrouter", 1000, 0).unwrap();
        assert_eq!(tracker.snapshot().spent_this_month_usd, 3.0);

        assert!(!tracker.can_afford("openrouter", 8.0));
    }

    #[test]
    fn charge_reports_over_cap_once_monthly_spend_exceeds_the_cap() {
        let mut config = AppConfig::default();
        config.budget.monthly_cap_usd = 5.0;
        let tracker = BudgetTracker::new(&config);

        let first = tracker.charge("openrouter", 1000, 0).unwrap();
        assert_eq!(first, ChargeOutcome::Ok(3.0));

        let second = tracker.charge("openrouter", 1000, 0).unwrap();
        assert_eq!(second, ChargeOutcome::OverCap(3.0));
        assert!(second.is_over_cap());
        assert_eq!(second.cost(), 3.0);

        assert!(!tracker.can_afford("openrouter", 0.01));
    }

    #[test]
    fn non_monetary_providers_never_gate_on_monthly_cap() {
        let config = AppConfig::default();
        let tracker = BudgetTracker::new(&config);
        assert!(tracker.can_afford("ollama", 999_999.0));
        tracker.charge("ollama", 50_000, 50_000).unwrap();
        assert_eq!(tracker.snapshot().spent_this_month_usd, 0.0);
    }

    #[test]
    fn reset_month_zeroes_spend_but_keeps_known_balance() {
        let config = AppConfig::default();
        let tracker = BudgetTracker::new(&config);
        tracker.charge("openrouter", 1000, 1000).unwrap();
        tracker.set_known_balance("openrouter", 42.0).unwrap();

        tracker.reset_month();

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.spent_this_month_usd, 0.0);
        let provider = snapshot.providers.iter().find(|p| p.name == "openrouter").unwrap();
        assert_eq!(provider.spent_tracked, 0.0);
        assert_eq!(provider.known_balance, Some(42.0));
    }

    #[test]
    fn override_monthly_cap_takes_effect_immediately() {
        let mut config = AppConfig::default();
        config.budget.monthly_cap_usd = 5.0;
        let tracker = BudgetTracker::new(&config);
        assert!(!tracker.can_afford("openrouter", 8.0));

        tracker.override_monthly_cap(100.0);
        assert!(tracker.can_afford("openrouter", 8.0));
        assert_eq!(tracker.snapshot().monthly_cap_usd, 100.0);
    }

    #[test]
    fn save_then_load_round_trips_state() {
        let config = AppConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("budget.json");

        let tracker = BudgetTracker::load(&config, &path).unwrap();
        tracker.charge("openrouter", 2000, 0).unwrap();
        tracker.save().unwrap();

        let reloaded = BudgetTracker::load(&config, &path).unwrap();
        assert_eq!(reloaded.snapshot().spent_this_month_usd, 6.0);
    }
}
