use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "admin.toml";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before reconnect `attempt` (1-based), doubling up to `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub ws_base_url: Option<String>,
    pub database_url: String,
    pub request_timeout: Duration,
    pub redirect_delay: Duration,
    pub login_route: String,
    pub page_size: u32,
    pub scroll_threshold_px: f64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3000/api".into(),
            ws_base_url: None,
            database_url: "sqlite://./data/admin_client.db".into(),
            request_timeout: Duration::from_secs(30),
            redirect_delay: Duration::from_secs(1),
            login_route: "/login".into(),
            page_size: 20,
            scroll_threshold_px: 100.0,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientSettings {
    pub fn for_server(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    /// WebSocket base: the explicit setting, or the API origin with its
    /// scheme swapped to `ws`/`wss`.
    pub fn ws_base(&self) -> Result<String> {
        if let Some(explicit) = &self.ws_base_url {
            return Ok(explicit.trim_end_matches('/').to_string());
        }
        let base = self.api_base_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = base.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else {
            Err(anyhow!("api_base_url must start with http:// or https://"))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base_url: Option<String>,
    ws_base_url: Option<String>,
    database_url: Option<String>,
    request_timeout_secs: Option<u64>,
    redirect_delay_ms: Option<u64>,
    login_route: Option<String>,
    page_size: Option<u32>,
    scroll_threshold_px: Option<f64>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
}

/// Defaults, then the TOML file (if present), then environment overrides.
pub fn load_settings(path: Option<&Path>) -> Result<ClientSettings> {
    let mut settings = ClientSettings::default();

    let path = path.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_FILE));
    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
        let file_cfg: FileSettings = toml::from_str(&raw)
            .with_context(|| format!("invalid settings file '{}'", path.display()))?;
        apply_file(&mut settings, file_cfg);
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings.database_url = normalize_database_url(&settings.database_url);
    Ok(settings)
}

fn apply_file(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.api_base_url {
        settings.api_base_url = v;
    }
    if let Some(v) = file_cfg.ws_base_url {
        settings.ws_base_url = Some(v);
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.request_timeout_secs {
        settings.request_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.redirect_delay_ms {
        settings.redirect_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.login_route {
        settings.login_route = v;
    }
    if let Some(v) = file_cfg.page_size {
        settings.page_size = v.clamp(1, 100);
    }
    if let Some(v) = file_cfg.scroll_threshold_px {
        settings.scroll_threshold_px = v;
    }
    if let Some(v) = file_cfg.reconnect_base_delay_ms {
        settings.reconnect.base_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_max_delay_ms {
        settings.reconnect.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_max_attempts {
        settings.reconnect.max_attempts = v;
    }
}

fn apply_env(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("ADMIN_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = lookup("ADMIN_WS_URL") {
        settings.ws_base_url = Some(v);
    }
    if let Some(v) = lookup("APP__WS_BASE_URL") {
        settings.ws_base_url = Some(v);
    }

    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = lookup("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout = Duration::from_secs(parsed);
        }
    }
    if let Some(v) = lookup("APP__REDIRECT_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.redirect_delay = Duration::from_millis(parsed);
        }
    }
    if let Some(v) = lookup("APP__RECONNECT_MAX_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.reconnect.max_attempts = parsed;
        }
    }
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
