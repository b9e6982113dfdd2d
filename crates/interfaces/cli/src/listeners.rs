//! Wires configured external listeners (§5) from `AppConfig` + environment
//! credentials. Credentials are deliberately read from the environment
//! rather than `aigent.toml` — the same split `aigent-config` uses for
//! provider API keys (`api_key_env` names a variable, never a literal key).

use aigent_config::AppConfig;
use aigent_listeners::{EmailListener, Listener, TelegramListener};

pub(crate) fn configured_listeners(config: &AppConfig) -> Vec<Box<dyn Listener>> {
    let mut listeners: Vec<Box<dyn Listener>> = Vec::new();

    if config.integrations.telegram_enabled {
        match std::env::var("TELEGRAM_BOT_TOKEN") {
            Ok(token) if !token.is_empty() => {
                listeners.push(Box::new(TelegramListener::new(token)));
            }
            _ => {
                tracing::warn!(
                    "integrations.telegram_enabled is set but TELEGRAM_BOT_TOKEN is unset; skipping"
                );
            }
        }
    }

    if config.integrations.email_enabled {
        let inbox_url = std::env::var("AIGENT_EMAIL_INBOX_URL").unwrap_or_default();
        let send_url = std::env::var("AIGENT_EMAIL_SEND_URL").unwrap_or_default();
        let api_key = std::env::var("AIGENT_EMAIL_API_KEY").unwrap_or_default();
        if inbox_url.is_empty() || send_url.is_empty() {
            tracing::warn!(
                "integrations.email_enabled is set but AIGENT_EMAIL_INBOX_URL/AIGENT_EMAIL_SEND_URL are unset; skipping"
            );
        } else {
            listeners.push(Box::new(EmailListener::new(inbox_url, send_url, api_key)));
        }
    }

    listeners
}
