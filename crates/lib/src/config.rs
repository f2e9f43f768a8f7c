//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.tern/config.json`) and environment.
//! Environment variables override credentials from the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::channels::bluesky;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Channel settings (Bluesky, Telegram).
    #[serde(default)]
    pub channels: ChannelsConfig,
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub bluesky: BlueskyChannelConfig,
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
}

/// Bluesky direct-message channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueskyChannelConfig {
    /// Handle or email to log in with. Overridden by BLUESKY_IDENTIFIER env when set.
    pub identifier: Option<String>,
    /// App password (not the account password). Overridden by BLUESKY_APP_PASSWORD env when set.
    pub app_password: Option<String>,
    /// PDS / entryway base URL (default https://bsky.social).
    pub service: Option<String>,
    /// Delay between polls of the chat log, in milliseconds (default 5000).
    pub poll_interval_ms: Option<u64>,
    /// Per-request timeout in seconds (default 30).
    pub request_timeout_secs: Option<u64>,
}

impl BlueskyChannelConfig {
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(bluesky::DEFAULT_POLL_INTERVAL)
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(bluesky::DEFAULT_REQUEST_TIMEOUT)
    }
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// Per-request timeout in seconds, added to the long-poll wait for getUpdates (default 30).
    pub request_timeout_secs: Option<u64>,
}

impl TelegramChannelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.filter(|s| *s > 0).unwrap_or(30))
    }
}

/// Trimmed, non-empty value of an env var.
fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn config_nonempty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve Bluesky identifier and app password: env overrides config, per field.
/// `None` unless both are present.
pub fn resolve_bluesky_credentials(config: &Config) -> Option<(String, String)> {
    let c = &config.channels.bluesky;
    let identifier =
        env_nonempty("BLUESKY_IDENTIFIER").or_else(|| config_nonempty(&c.identifier))?;
    let password =
        env_nonempty("BLUESKY_APP_PASSWORD").or_else(|| config_nonempty(&c.app_password))?;
    Some((identifier, password))
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    env_nonempty("TELEGRAM_BOT_TOKEN")
        .or_else(|| config_nonempty(&config.channels.telegram.bot_token))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("TERN_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".tern").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (or TERN_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
