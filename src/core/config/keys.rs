use std::str::FromStr;

use super::data::Config;
use super::io::ConfigError;

/// Keys accepted by `syntra set` and `syntra unset`.
pub const CONFIG_KEYS: &[&str] = &[
    "chat-api-url",
    "auth-api-url",
    "api-key",
    "history-page-size",
    "history-stale-secs",
    "details-stale-secs",
    "list-stale-secs",
    "fetch-attempts",
    "fetch-retry-delay-ms",
    "settle-delay-ms",
    "settle-attempts",
    "request-timeout-secs",
];

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_url(key: &str, value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.trim_end_matches('/').to_string())
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

impl Config {
    /// Set `key` (underscores and dashes are interchangeable) from text.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match normalize(key).as_str() {
            "chat-api-url" => self.chat_api_url = Some(parse_url(key, value)?),
            "auth-api-url" => self.auth_api_url = Some(parse_url(key, value)?),
            "api-key" => {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
                self.api_key = Some(trimmed.to_string());
            }
            "history-page-size" => self.history_page_size = Some(parse(key, value)?),
            "history-stale-secs" => self.history_stale_secs = Some(parse(key, value)?),
            "details-stale-secs" => self.details_stale_secs = Some(parse(key, value)?),
            "list-stale-secs" => self.list_stale_secs = Some(parse(key, value)?),
            "fetch-attempts" => self.fetch_attempts = Some(parse(key, value)?),
            "fetch-retry-delay-ms" => self.fetch_retry_delay_ms = Some(parse(key, value)?),
            "settle-delay-ms" => self.settle_delay_ms = Some(parse(key, value)?),
            "settle-attempts" => self.settle_attempts = Some(parse(key, value)?),
            "request-timeout-secs" => self.request_timeout_secs = Some(parse(key, value)?),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    pub fn unset_value(&mut self, key: &str) -> Result<(), ConfigError> {
        match normalize(key).as_str() {
            "chat-api-url" => self.chat_api_url = None,
            "auth-api-url" => self.auth_api_url = None,
            "api-key" => self.api_key = None,
            "history-page-size" => self.history_page_size = None,
            "history-stale-secs" => self.history_stale_secs = None,
            "details-stale-secs" => self.details_stale_secs = None,
            "list-stale-secs" => self.list_stale_secs = None,
            "fetch-attempts" => self.fetch_attempts = None,
            "fetch-retry-delay-ms" => self.fetch_retry_delay_ms = None,
            "settle-delay-ms" => self.settle_delay_ms = None,
            "settle-attempts" => self.settle_attempts = None,
            "request-timeout-secs" => self.request_timeout_secs = None,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

fn normalize(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace('_', "-")
}
