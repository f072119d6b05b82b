//! Runtime configuration, read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryOptions;

/// Configuration of the offline data-access layer.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineConfig {
    /// Base URL of the counting backend.
    pub api_url: String,
    /// Bearer token sent with every request.
    pub auth_token: Option<String>,
    /// Directory holding `offline.db`.
    pub data_dir: PathBuf,
    /// Cached values older than this are served with `_stale: true`.
    pub stale_threshold: Duration,
    /// Default per-request timeout; a timeout counts as a transport failure.
    pub request_timeout: Duration,
    /// Network attempts per user operation before falling back.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_delay: Duration,
    /// How often the background worker probes and syncs.
    pub sync_interval: Duration,
    /// Path probed to confirm reachability.
    pub probe_path: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            auth_token: None,
            data_dir: default_data_dir(),
            stale_threshold: Duration::from_secs(300),
            request_timeout: Duration::from_secs(15),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            sync_interval: Duration::from_secs(30),
            probe_path: "/health".to_string(),
        }
    }
}

impl OfflineConfig {
    /// Defaults overridden by `STOCKCOUNT_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("STOCKCOUNT_API_URL") {
            config.api_url = url;
        }
        if let Ok(token) = std::env::var("STOCKCOUNT_AUTH_TOKEN") {
            if !token.trim().is_empty() {
                config.auth_token = Some(token);
            }
        }
        if let Ok(dir) = std::env::var("STOCKCOUNT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse::<u64>("STOCKCOUNT_STALE_SECS") {
            config.stale_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("STOCKCOUNT_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("STOCKCOUNT_MAX_RETRIES") {
            config.max_retries = n;
        }
        if let Some(ms) = env_parse::<u64>("STOCKCOUNT_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("STOCKCOUNT_SYNC_INTERVAL_SECS") {
            config.sync_interval = Duration::from_secs(secs.max(1));
        }

        config
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("offline.db")
    }

    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions::new(self.max_retries, self.retry_delay)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring malformed environment value");
            None
        }
    }
}

/// `{app_data_dir}/stockcount`, falling back to `~/.local/share/stockcount`.
fn default_data_dir() -> PathBuf {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .unwrap_or_else(std::env::temp_dir);
    base.join("stockcount")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = OfflineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.stale_threshold, Duration::from_secs(300));
        assert!(config.database_path().ends_with("stockcount/offline.db"));
    }

    #[test]
    fn builders_override_fields() {
        let config = OfflineConfig::default()
            .with_api_url("http://10.0.0.2:9000")
            .with_token("secret")
            .with_retries(5, Duration::from_millis(50));
        assert_eq!(config.api_url, "http://10.0.0.2:9000");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(
            config.retry_options(),
            RetryOptions::new(5, Duration::from_millis(50))
        );
    }
}
