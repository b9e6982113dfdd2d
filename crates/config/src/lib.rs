use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub directive: String,
    pub data_dir: String,
    /// Root directory tool invocations are sandboxed to. Distinct from
    /// `data_dir`, which holds the agent's own state/blob/memory files.
    pub workspace_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Aigent".to_string(),
            directive: "Be a careful, transparent, and useful assistant to your creator."
                .to_string(),
            data_dir: ".aigent/data".to_string(),
            workspace_path: ".".to_string(),
        }
    }
}

/// Approval posture for tool execution. Mirrors `exec::ExecutionPolicy`'s
/// coarse approval knob; kept here so it's configurable from `aigent.toml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// No interactive approval gate at all.
    Autonomous,
    /// Read-only and exempted tools run unattended; mutating ones prompt.
    #[default]
    Balanced,
    /// Every tool invocation prompts, including reads.
    Safer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Additional paths (beyond the workspace root, which is always
    /// trusted) gait write operations may target.
    pub trusted_write_paths: Vec<String>,
    pub trusted_repos: Vec<String>,
    pub allow_system_read: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            trusted_write_paths: vec![],
            trusted_repos: vec![],
            allow_system_read: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub approval_mode: ApprovalMode,
    pub allow_shell: bool,
    pub allow_wasm: bool,
    pub tool_allowlist: Vec<String>,
    pub tool_denylist: Vec<String>,
    pub approval_exempt_tools: Vec<String>,
    pub git_auto_commit: bool,
    pub sandbox_enabled: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::Balanced,
            allow_shell: false,
            allow_wasm: false,
            tool_allowlist: vec![],
            tool_denylist: vec![],
            approval_exempt_tools: vec![
                "calendar_add_event".to_string(),
                "remind_me".to_string(),
                "draft_email".to_string(),
                "web_search".to_string(),
            ],
            git_auto_commit: false,
            sandbox_enabled: true,
        }
    }
}

/// A single provider's tier-ladder placement plus static cost/currency facts.
///
/// Mirrors spec.md §3's "Provider record", minus the runtime-only fields
/// (`spent_tracked`, `balance_updated_at`) that live in the budget tracker
/// rather than config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    /// Model identifier passed on the wire (e.g. `"llama3.1:8b"` for Ollama,
    /// `"openai/gpt-4o-mini"` for OpenRouter).
    pub model: String,
    pub tier: String,
    pub currency: String,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub api_key_env: String,
    pub known_balance: Option<f64>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            model: String::new(),
            tier: "unknown".to_string(),
            currency: "USD".to_string(),
            input_per_1k: 0.0,
            output_per_1k: 0.0,
            api_key_env: String::new(),
            known_balance: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub ollama_base_url: String,
    /// Ordered candidate providers per tier, tried in list order by the
    /// router. Keys match `llm::Tier::as_str()`.
    pub level1: Vec<ProviderConfig>,
    pub level2: Vec<ProviderConfig>,
    pub level3: Vec<ProviderConfig>,
    pub coding_level1: Vec<ProviderConfig>,
    pub coding_level2: Vec<ProviderConfig>,
    pub coding_level3: Vec<ProviderConfig>,
    pub max_fallback: usize,
    pub unhealthy_cooldown_secs: u64,
    pub consecutive_failures_to_mark_unhealthy: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            ollama_base_url: "http://localhost:11434".to_string(),
            level1: vec![ProviderConfig {
                name: "openrouter".to_string(),
                model: "anthropic/claude-3.7-sonnet".to_string(),
                tier: "paid".to_string(),
                currency: "USD".to_string(),
                input_per_1k: 3.0,
                output_per_1k: 15.0,
                api_key_env: "OPENROUTER_API_KEY".to_string(),
                known_balance: None,
            }],
            level2: vec![ProviderConfig {
                name: "openrouter-mini".to_string(),
                model: "openai/gpt-4o-mini".to_string(),
                tier: "paid".to_string(),
                currency: "USD".to_string(),
                input_per_1k: 0.15,
                output_per_1k: 0.6,
                api_key_env: "OPENROUTER_API_KEY".to_string(),
                known_balance: None,
            }],
            level3: vec![ProviderConfig {
                name: "ollama".to_string(),
                model: "llama3.1:8b".to_string(),
                tier: "free".to_string(),
                currency: "requests".to_string(),
                input_per_1k: 0.0,
                output_per_1k: 0.0,
                api_key_env: String::new(),
                known_balance: None,
            }],
            coding_level1: vec![],
            coding_level2: vec![],
            coding_level3: vec![],
            max_fallback: 3,
            unhealthy_cooldown_secs: 600,
            consecutive_failures_to_mark_unhealthy: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub retrieval_count: usize,
    pub relevance_threshold: f32,
    pub decay_factor: f32,
    pub max_context_tokens: usize,
    pub short_term_capacity: usize,
    pub short_term_max_age_hours: i64,
    pub maintenance_every_n_iterations: u64,
    pub importance_expiry_threshold: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retrieval_count: 8,
            relevance_threshold: 0.2,
            decay_factor: 0.98,
            max_context_tokens: 6000,
            short_term_capacity: 50,
            short_term_max_age_hours: 48,
            maintenance_every_n_iterations: 10,
            importance_expiry_threshold: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub monthly_cap_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_cap_usd: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    pub min_sleep_secs: u64,
    pub max_sleep_secs: u64,
    pub active_sleep_secs: u64,
    pub idle_iterations_before_long_sleep: u64,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            min_sleep_secs: 5,
            max_sleep_secs: 3600,
            active_sleep_secs: 30,
            idle_iterations_before_long_sleep: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Path prefixes a self-update proposal may touch. Never include the
    /// safety crate or the logging init module here — see
    /// `safety::validate_self_update`, which rejects those paths even if
    /// they were present in this list.
    pub self_update_allowlist: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            self_update_allowlist: vec![
                "crates/tools".to_string(),
                "crates/prompt".to_string(),
                "crates/thinker".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: ".aigent/logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationsConfig {
    pub telegram_enabled: bool,
    pub email_enabled: bool,
}

impl Default for IntegrationsConfig {
    fn default() -> Self {
        Self {
            telegram_enabled: false,
            email_enabled: false,
        }
    }
}

/// Authentication mode for the (out-of-scope) dashboard HTTP surface.
/// Carried here only so the creator-gated budget override path (§4.6 rule 7)
/// has something concrete to check against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    #[default]
    Off,
    SingleCreatorOidc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfUpdateConfig {
    pub remote_repo_url: Option<String>,
    pub remote_repo_token_env: Option<String>,
    pub health_check_grace_secs: u64,
}

impl Default for SelfUpdateConfig {
    fn default() -> Self {
        Self {
            remote_repo_url: None,
            remote_repo_token_env: None,
            health_check_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub budget: BudgetConfig,
    pub sleep: SleepConfig,
    pub safety: SafetyConfig,
    pub telemetry: TelemetryConfig,
    pub integrations: IntegrationsConfig,
    pub self_update: SelfUpdateConfig,
    pub auth_mode: AuthMode,
    pub git: GitConfig,
    pub tools: ToolsConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.ollama_base_url = value;
            }
        }
        if let Ok(value) = env::var("AIGENT_MONTHLY_CAP_USD") {
            if let Ok(cap) = value.parse() {
                config.budget.monthly_cap_usd = cap;
            }
        }
        if let Ok(value) = env::var("AIGENT_DATA_DIR") {
            if !value.is_empty() {
                config.agent.data_dir = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        // Write-then-rename so a crash mid-write never leaves a truncated
        // config file behind for the next `load_from` to choke on.
        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, rendered)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn data_path(&self, relative: impl AsRef<Path>) -> std::path::PathBuf {
        Path::new(&self.agent.data_dir).join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_budget_and_sleep_bounds() {
        let config = AppConfig::default();
        assert!(config.budget.monthly_cap_usd > 0.0);
        assert!(config.sleep.min_sleep_secs < config.sleep.max_sleep_secs);
        assert!(
            config.memory.relevance_threshold >= 0.0 && config.memory.relevance_threshold <= 1.0
        );
    }

    #[test]
    fn load_from_missing_file_returns_default() {
        let config = AppConfig::load_from("/nonexistent/path/aigent.toml").unwrap();
        assert_eq!(config.agent.name, "Aigent");
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aigent.toml");

        let mut config = AppConfig::default();
        config.agent.name = "Test Agent".to_string();
        config.budget.monthly_cap_usd = 12.5;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.agent.name, "Test Agent");
        assert_eq!(loaded.budget.monthly_cap_usd, 12.5);
    }

    #[test]
    fn safety_allowlist_never_includes_safety_crate() {
        let config = AppConfig::default();
        assert!(
            !config
                .safety
                .self_update_allowlist
                .iter()
                .any(|p| p.contains("crates/safety"))
        );
    }
}
