//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL. Without one the server runs on the
    /// in-memory ledger store.
    pub database_url: Option<String>,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    /// Deadline applied to each transfer request
    pub transfer_timeout: Duration,

    /// Upper bound on waiting for a single row lock
    pub lock_timeout: Duration,

    /// Attempts made for a transfer aborted by a retryable store error
    pub transfer_max_attempts: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let database_max_connections = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?;

        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let port = parse_or(&lookup, "PORT", 3000)?;

        let environment = lookup("ENVIRONMENT").unwrap_or_else(|| "development".to_string());

        let transfer_timeout_ms: u64 = parse_or(&lookup, "TRANSFER_TIMEOUT_MS", 5000)?;
        let lock_timeout_ms: u64 = parse_or(&lookup, "LOCK_TIMEOUT_MS", 2000)?;
        if lock_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("LOCK_TIMEOUT_MS"));
        }

        let transfer_max_attempts: u32 = parse_or(&lookup, "TRANSFER_MAX_ATTEMPTS", 3)?;
        if transfer_max_attempts == 0 {
            return Err(ConfigError::InvalidValue("TRANSFER_MAX_ATTEMPTS"));
        }

        let config = Self {
            database_url,
            database_max_connections,
            host,
            port,
            environment,
            transfer_timeout: Duration::from_millis(transfer_timeout_ms),
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            transfer_max_attempts,
        };

        // The in-memory ledger is never used in production
        if config.is_production() && config.database_url.is_none() {
            return Err(ConfigError::MissingEnv("DATABASE_URL"));
        }

        Ok(config)
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Socket address the server binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue(key)),
        None => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
