use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::cache::CacheSettings;
use crate::core::session::SessionSettings;

pub const DEFAULT_CHAT_API_URL: &str = "http://localhost:8000/api/v1";
pub const DEFAULT_AUTH_API_URL: &str = "http://localhost:8001/api/v1";

pub const CHAT_API_URL_ENV: &str = "SYNTRA_CHAT_API_URL";
pub const AUTH_API_URL_ENV: &str = "SYNTRA_AUTH_API_URL";
pub const CHAT_API_KEY_ENV: &str = "SYNTRA_CHAT_API_KEY";

/// Settings read from `config.toml`. Unset fields fall back to built-in
/// defaults through the accessor methods.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Base URL of the chat backend, e.g. `https://chat.example.com/api/v1`
    pub chat_api_url: Option<String>,
    /// Base URL of the authentication service
    pub auth_api_url: Option<String>,
    /// Static key sent as `x-api-key` on every chat backend request
    pub api_key: Option<String>,
    /// Turns requested per history fetch
    pub history_page_size: Option<u32>,
    pub history_stale_secs: Option<u64>,
    pub details_stale_secs: Option<u64>,
    pub list_stale_secs: Option<u64>,
    /// Attempts per cache fetch before the error is surfaced
    pub fetch_attempts: Option<u32>,
    pub fetch_retry_delay_ms: Option<u64>,
    /// Wait between a finished reply and the history reload confirming it
    pub settle_delay_ms: Option<u64>,
    pub settle_attempts: Option<u32>,
    pub request_timeout_secs: Option<u64>,
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
///
/// # Examples
/// - Unix: `/home/user/.config/syntra/config.toml` → `~/.config/syntra/config.toml`
/// - macOS: `/Users/user/Library/Application Support/...` → `~/Library/Application Support/...`
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Config {
    pub fn chat_api_url(&self) -> String {
        env_value(CHAT_API_URL_ENV)
            .or_else(|| self.chat_api_url.clone())
            .unwrap_or_else(|| DEFAULT_CHAT_API_URL.to_string())
    }

    pub fn auth_api_url(&self) -> String {
        env_value(AUTH_API_URL_ENV)
            .or_else(|| self.auth_api_url.clone())
            .unwrap_or_else(|| DEFAULT_AUTH_API_URL.to_string())
    }

    pub fn api_key(&self) -> Option<String> {
        env_value(CHAT_API_KEY_ENV).or_else(|| self.api_key.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(30))
    }

    pub fn cache_settings(&self) -> CacheSettings {
        let defaults = CacheSettings::default();
        CacheSettings {
            history_ttl: self
                .history_stale_secs
                .map_or(defaults.history_ttl, Duration::from_secs),
            details_ttl: self
                .details_stale_secs
                .map_or(defaults.details_ttl, Duration::from_secs),
            list_ttl: self
                .list_stale_secs
                .map_or(defaults.list_ttl, Duration::from_secs),
            history_page_size: self
                .history_page_size
                .unwrap_or(defaults.history_page_size),
            fetch_attempts: self.fetch_attempts.unwrap_or(defaults.fetch_attempts),
            retry_delay: self
                .fetch_retry_delay_ms
                .map_or(defaults.retry_delay, Duration::from_millis),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        let defaults = SessionSettings::default();
        SessionSettings {
            settle_delay: self
                .settle_delay_ms
                .map_or(defaults.settle_delay, Duration::from_millis),
            settle_attempts: self.settle_attempts.unwrap_or(defaults.settle_attempts),
        }
    }

    pub fn print_all(&self) {
        fn show<T: std::fmt::Display>(value: &Option<T>) -> String {
            value
                .as_ref()
                .map_or_else(|| "(unset)".to_string(), |v| v.to_string())
        }

        println!("Current configuration:");
        println!("  chat-api-url: {}", show(&self.chat_api_url));
        println!("  auth-api-url: {}", show(&self.auth_api_url));
        match &self.api_key {
            Some(_) => println!("  api-key: (set)"),
            None => println!("  api-key: (unset)"),
        }
        println!("  history-page-size: {}", show(&self.history_page_size));
        println!("  history-stale-secs: {}", show(&self.history_stale_secs));
        println!("  details-stale-secs: {}", show(&self.details_stale_secs));
        println!("  list-stale-secs: {}", show(&self.list_stale_secs));
        println!("  fetch-attempts: {}", show(&self.fetch_attempts));
        println!("  fetch-retry-delay-ms: {}", show(&self.fetch_retry_delay_ms));
        println!("  settle-delay-ms: {}", show(&self.settle_delay_ms));
        println!("  settle-attempts: {}", show(&self.settle_attempts));
        println!("  request-timeout-secs: {}", show(&self.request_timeout_secs));
    }
}
