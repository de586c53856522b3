use std::{fs, path::Path, time::Duration};

use tracing::warn;

use crate::{
    api::{DEFAULT_PAGE_SIZE, DEFAULT_REQUEST_TIMEOUT},
    connection::DEFAULT_RECONNECT_DELAY,
};

pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub api_base_url: String,
    /// Falls back to `api_base_url` when unset.
    pub ws_url: Option<String>,
    pub cache_database_url: String,
    pub page_size: u32,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000".into(),
            ws_url: None,
            cache_database_url: "sqlite://./data/chat_cache.db".into(),
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ClientSettings {
    pub fn websocket_url(&self) -> &str {
        self.ws_url.as_deref().unwrap_or(&self.api_base_url)
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

/// Defaults, then the toml file at `path` if readable, then environment.
pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();
    if let Ok(raw) = fs::read_to_string(path) {
        apply_file_overrides(&mut settings, &raw);
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.cache_database_url = normalize_database_url(&settings.cache_database_url);
    settings
}

fn apply_file_overrides(settings: &mut ClientSettings, raw: &str) {
    let table = match raw.parse::<toml::Table>() {
        Ok(table) => table,
        Err(err) => {
            warn!(error = %err, "ignoring malformed settings file");
            return;
        }
    };

    if let Some(v) = table.get("api_base_url").and_then(|v| v.as_str()) {
        settings.api_base_url = v.to_string();
    }
    if let Some(v) = table.get("ws_url").and_then(|v| v.as_str()) {
        settings.ws_url = Some(v.to_string());
    }
    if let Some(v) = table.get("cache_database_url").and_then(|v| v.as_str()) {
        settings.cache_database_url = v.to_string();
    }
    if let Some(v) = table
        .get("page_size")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok())
    {
        settings.page_size = v;
    }
    if let Some(v) = table
        .get("request_timeout_secs")
        .and_then(|v| v.as_integer())
        .and_then(|v| u64::try_from(v).ok())
    {
        settings.request_timeout = Duration::from_secs(v);
    }
    if let Some(v) = table
        .get("reconnect_delay_ms")
        .and_then(|v| v.as_integer())
        .and_then(|v| u64::try_from(v).ok())
    {
        settings.reconnect_delay = Duration::from_millis(v);
    }
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = var("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = var("WS_URL") {
        settings.ws_url = Some(v);
    }
    if let Some(v) = var("APP__WS_URL") {
        settings.ws_url = Some(v);
    }

    if let Some(v) = var("CACHE_DATABASE_URL") {
        settings.cache_database_url = v;
    }
    if let Some(v) = var("APP__CACHE_DATABASE_URL") {
        settings.cache_database_url = v;
    }

    if let Some(parsed) = var("APP__PAGE_SIZE").and_then(|v| v.parse::<u32>().ok()) {
        settings.page_size = parsed;
    }
    if let Some(parsed) = var("APP__REQUEST_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
        settings.request_timeout = Duration::from_secs(parsed);
    }
    if let Some(parsed) = var("APP__RECONNECT_DELAY_MS").and_then(|v| v.parse::<u64>().ok()) {
        settings.reconnect_delay = Duration::from_millis(parsed);
    }
}

/// Turns a bare file path into a sqlite url; other urls pass through.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().cache_database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
