//! Typed configuration.
//!
//! Connection settings come from environment variables and fail fast when
//! required ones are missing. Engine tuning (retry policy, lanes, batching)
//! can additionally be loaded from a TOML file; every field defaults.
//! Tokens are wrapped in `secrecy::SecretString` to keep them out of logs.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use self::secrets::SecretString;
use serde::Deserialize;

use crate::engine::{DispatchConfig, RetryPolicy};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub deployment_url: String,
    pub master_token: Option<SecretString>,
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            deployment_url: required_var("WT_DEPLOYMENT_URL")?,
            master_token: std::env::var("WT_MASTER_TOKEN").ok().map(SecretString::from),
            max_concurrent: parsed_var("WT_MAX_CONCURRENT", 10)?,
            max_attempts: parsed_var("WT_MAX_ATTEMPTS", 10)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("environment variable {name} is not valid: {raw}"))),
        Err(_) => Ok(default),
    }
}

/// Engine tuning, usually read from a TOML file.
///
/// ```toml
/// max_concurrent = 4
///
/// [retry]
/// base_delay_ms = 100
/// max_attempts = 5
///
/// [provision]
/// batch_limit = 10
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent: Option<usize>,
    pub retry: RetryConfig,
    pub provision: ProvisionConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub growth: f64,
    pub max_delay_ms: u64,
    /// Falls back to `WT_MAX_ATTEMPTS` when unset.
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            growth: policy.growth,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_attempts: None,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            base_delay: Duration::from_millis(config.base_delay_ms),
            growth: config.growth,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config
                .max_attempts
                .unwrap_or(RetryPolicy::default().max_attempts),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub batch_limit: usize,
    pub per_item_delay_ms: u64,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            batch_limit: 25,
            per_item_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub page_size: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self { page_size: 100 }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read engine config {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad engine config {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Dispatcher settings: environment values, overridden by this file.
    pub fn dispatch_config(&self, env: &Config) -> DispatchConfig {
        let mut retry = RetryPolicy::from(&self.retry);
        retry.max_attempts = self.retry.max_attempts.unwrap_or(env.max_attempts);
        DispatchConfig {
            max_concurrent: self.max_concurrent.unwrap_or(env.max_concurrent),
            retry,
        }
    }
}
