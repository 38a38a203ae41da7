//! Runtime tuning for the messaging core.
//!
//! Every value has a default; environment variables (optionally loaded from a
//! `.env` file) override them.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

pub const DEFAULT_THREAD_LIMIT: usize = 100;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BODY_LEN: usize = 10_000;
pub const DEFAULT_AGGREGATE_CONCURRENCY: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingConfig {
    /// Most recent messages returned by a thread load.
    pub thread_limit: usize,
    /// Conversation list poll period (fallback when push is down).
    pub poll_interval: Duration,
    /// Upper bound for any single store or identity call.
    pub store_timeout: Duration,
    /// Longest accepted message body, in characters.
    pub max_body_len: usize,
    /// Counterpart sub-queries allowed in flight while aggregating.
    pub aggregate_concurrency: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            thread_limit: DEFAULT_THREAD_LIMIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            max_body_len: DEFAULT_MAX_BODY_LEN,
            aggregate_concurrency: DEFAULT_AGGREGATE_CONCURRENCY,
        }
    }
}

impl MessagingConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        info!(
            thread_limit = config.thread_limit,
            poll_ms = config.poll_interval.as_millis() as u64,
            timeout_ms = config.store_timeout.as_millis() as u64,
            "Messaging configuration loaded"
        );
        Ok(config)
    }

    /// Build from an arbitrary key lookup. Missing keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            thread_limit: parse_or(&lookup, "HANGAR_THREAD_LIMIT", defaults.thread_limit)?,
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "HANGAR_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            store_timeout: Duration::from_millis(parse_or(
                &lookup,
                "HANGAR_STORE_TIMEOUT_MS",
                defaults.store_timeout.as_millis() as u64,
            )?),
            max_body_len: parse_or(&lookup, "HANGAR_MAX_BODY_LEN", defaults.max_body_len)?,
            aggregate_concurrency: parse_or(
                &lookup,
                "HANGAR_AGGREGATE_CONCURRENCY",
                defaults.aggregate_concurrency,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_limit == 0 {
            return Err(ConfigError::Zero { key: "HANGAR_THREAD_LIMIT" });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero { key: "HANGAR_POLL_INTERVAL_MS" });
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::Zero { key: "HANGAR_STORE_TIMEOUT_MS" });
        }
        if self.max_body_len == 0 {
            return Err(ConfigError::Zero { key: "HANGAR_MAX_BODY_LEN" });
        }
        if self.aggregate_concurrency == 0 {
            return Err(ConfigError::Zero { key: "HANGAR_AGGREGATE_CONCURRENCY" });
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}
