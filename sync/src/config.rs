//! Configuration for the sync runtime.

use nestlog_engine::{RetryPolicy, DEFAULT_STORAGE_KEY};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Every tunable of the sync runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Base URL of the remote activities API
    pub api_base_url: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Records pushed concurrently within one chunk
    pub chunk_size: usize,
    /// Pause between push chunks
    pub chunk_pause: Duration,
    /// Page size of remote listings
    pub page_size: u32,
    /// Minimum age before a remotely missing record is removed locally
    pub deletion_grace: Duration,
    pub retry: RetryPolicy,
    /// Wait after connectivity returns before the recovery pass
    pub stabilize_delay: Duration,
    /// Period of the background pass
    pub periodic_interval: Duration,
    /// Owners (babies) to pull in addition to those already stored locally
    pub owners: Vec<String>,
    /// Directory for the snapshot file; in-memory storage when unset
    pub storage_dir: Option<PathBuf>,
    pub storage_key: String,
    /// Buffered events per subscriber before the slowest one lags
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            request_timeout: Duration::from_secs(15),
            chunk_size: 5,
            chunk_pause: Duration::from_millis(250),
            page_size: 100,
            deletion_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            stabilize_delay: Duration::from_secs(2),
            periodic_interval: Duration::from_secs(5 * 60),
            owners: Vec::new(),
            storage_dir: None,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `NESTLOG_*` environment variables, falling
    /// back to the defaults. A `.env` file is honored.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("NESTLOG_API_URL") {
            config.api_base_url = url;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "NESTLOG_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var(&lookup, "NESTLOG_CHUNK_SIZE")? {
            config.chunk_size = size;
        }
        if let Some(ms) = parse_var(&lookup, "NESTLOG_CHUNK_PAUSE_MS")? {
            config.chunk_pause = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var(&lookup, "NESTLOG_PAGE_SIZE")? {
            config.page_size = size;
        }
        if let Some(ms) = parse_var(&lookup, "NESTLOG_DELETION_GRACE_MS")? {
            config.deletion_grace = Duration::from_millis(ms);
        }
        if let Some(list) = lookup("NESTLOG_RETRY_DELAYS_MS") {
            config.retry.delays = split_list(&list)
                .map(|item| {
                    item.parse().map(Duration::from_millis).map_err(|_| ConfigError::Invalid {
                        var: "NESTLOG_RETRY_DELAYS_MS",
                        value: list.clone(),
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(max) = parse_var(&lookup, "NESTLOG_MAX_RETRIES")? {
            config.retry.max_retries = max;
        }
        if let Some(ms) = parse_var(&lookup, "NESTLOG_STABILIZE_MS")? {
            config.stabilize_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "NESTLOG_PERIODIC_INTERVAL_MS")? {
            config.periodic_interval = Duration::from_millis(ms);
        }
        if let Some(list) = lookup("NESTLOG_OWNERS") {
            config.owners = split_list(&list).map(str::to_string).collect();
        }
        if let Some(dir) = lookup("NESTLOG_STORAGE_DIR") {
            config.storage_dir = Some(PathBuf::from(dir));
        }
        if let Some(key) = lookup("NESTLOG_STORAGE_KEY") {
            config.storage_key = key;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        normalize_endpoint(&self.api_base_url)?;
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                var: "NESTLOG_CHUNK_SIZE",
                value: "0".into(),
            });
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid {
                var: "NESTLOG_PAGE_SIZE",
                value: "0".into(),
            });
        }
        if self.periodic_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "NESTLOG_PERIODIC_INTERVAL_MS",
                value: "0".into(),
            });
        }
        if self.storage_key.trim().is_empty() {
            return Err(ConfigError::Invalid {
                var: "NESTLOG_STORAGE_KEY",
                value: self.storage_key.clone(),
            });
        }
        Ok(())
    }
}

/// Trim a base URL and require an http(s) scheme.
pub fn normalize_endpoint(raw: &str) -> Result<String, ConfigError> {
    let endpoint = raw.trim();
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(ConfigError::InvalidEndpoint(raw.to_string()))
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|item| !item.is_empty())
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },

    #[error("API URL must include http:// or https://, got '{0}'")]
    InvalidEndpoint(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}
