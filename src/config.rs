//! Engine configuration: batching knobs, upstream LLM endpoint, market-data
//! endpoint. Loaded from a JSON file; every field has a default.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming an optional config file.
pub const CONFIG_PATH_ENV: &str = "AGRIVISION_I18N_CONFIG";

/// Upper bound on either upstream retry count.
pub const MAX_RETRIES: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct I18nConfig {
    /// Language the UI strings are authored in; never translated.
    pub base_language: String,
    /// Quiet period before a drain, letting one form's strings share a batch.
    pub debounce_ms: u64,
    /// Joins the texts of one batch into a single upstream payload.
    pub separator: String,
    /// Upper bound on one payload's length in chars. 0 means unlimited.
    pub max_batch_chars: usize,
    pub upstream: UpstreamConfig,
    pub market: MarketConfig,
}

impl Default for I18nConfig {
    fn default() -> Self {
        Self {
            base_language: "en".into(),
            debounce_ms: 100,
            separator: "\n---\n".into(),
            max_batch_chars: 0,
            upstream: UpstreamConfig::default(),
            market: MarketConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// OpenAI-compatible API root (`{base_url}/v1/chat/completions`).
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
    /// Minimum spacing between requests (e.g. 100ms = 10 req/s).
    pub min_interval_ms: u64,
    pub max_rate_limit_retries: u32,
    pub max_server_retries: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".into(),
            model: "gemini-2.0-flash".into(),
            api_key_env: "GEMINI_API_KEY".into(),
            timeout_secs: 30,
            min_interval_ms: 100,
            max_rate_limit_retries: 3,
            max_server_retries: 2,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub base_url: String,
    /// data.gov.in resource holding daily mandi prices.
    pub resource_id: String,
    pub api_key_env: String,
    pub limit: u32,
    pub timeout_secs: u64,
    pub ttl_secs: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.data.gov.in".into(),
            resource_id: "9ef84268-d588-465a-a308-a864a43d0070".into(),
            api_key_env: "MARKET_DATA_API_KEY".into(),
            limit: 2000,
            timeout_secs: 15,
            ttl_secs: 600,
        }
    }
}

impl MarketConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl I18nConfig {
    /// Load and validate a JSON config file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$AGRIVISION_I18N_CONFIG` when set, otherwise defaults.
    pub fn from_env_or_default() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load_from_file(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_language.trim().is_empty() {
            return Err(ConfigError::Invalid("base_language must not be empty".into()));
        }
        if self.separator.is_empty() {
            return Err(ConfigError::Invalid("separator must not be empty".into()));
        }
        let retries = self.upstream.max_rate_limit_retries.max(self.upstream.max_server_retries);
        if retries > MAX_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "upstream retry counts must be at most {MAX_RETRIES}, got {retries}"
            )));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
