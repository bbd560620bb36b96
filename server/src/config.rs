//! Configuration management for the server.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Upper bound for the `limit` of a listing
    pub max_page_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_page_size: 500,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = env::var("HOST").unwrap_or(defaults.host);

        let port = match env::var("PORT") {
            Ok(value) => value.parse().map_err(|_| ConfigError::InvalidPort(value))?,
            Err(_) => defaults.port,
        };

        let max_page_size = match env::var("MAX_PAGE_SIZE") {
            Ok(value) => match value.parse() {
                Ok(size) if size > 0 => size,
                _ => return Err(ConfigError::InvalidPageSize(value)),
            },
            Err(_) => defaults.max_page_size,
        };

        Ok(Self {
            host,
            port,
            max_page_size,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value: {0}")]
    InvalidPort(String),

    #[error("Invalid MAX_PAGE_SIZE value: {0}")]
    InvalidPageSize(String),
}
