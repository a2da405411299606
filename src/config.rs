// Configuration surface consumed at startup. Immutable once the pool is running.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub token: TokenConfig,
    pub archive: ArchiveConfig,
    pub vendor: Option<VendorConfig>,
}

impl Config {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.token.validate()?;
        self.archive.validate()?;
        if let Some(vendor) = &self.vendor {
            vendor.validate()?;
        }
        Ok(())
    }
}

// What happens to jobs still queued when the pool is stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    // Workers keep taking queued jobs until the intake queue is empty
    #[default]
    Drain,
    // Workers finish the job in hand; queued jobs get a shutdown failure
    Abandon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub intake_queue_capacity: usize,
    pub shutdown_policy: ShutdownPolicy,
    // Upper bound on a single vendor call, none by default
    pub fetch_timeout_ms: Option<u64>,
    pub token_retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            intake_queue_capacity: 32,
            shutdown_policy: ShutdownPolicy::Drain,
            fetch_timeout_ms: None,
            token_retry: RetryConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn new(worker_count: usize, intake_queue_capacity: usize) -> Self {
        Self {
            worker_count,
            intake_queue_capacity,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid(
                "pool.worker_count must be at least 1".to_string(),
            ));
        }
        if self.intake_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pool.intake_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.fetch_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "pool.fetch_timeout_ms must be positive when set".to_string(),
            ));
        }
        self.token_retry.validate()
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }
}

// Retry policy for a worker that fails to obtain a token.
// Zero retries means the job fails on the first auth error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::Invalid(
                "jitter_factor must be within [0, 1]".to_string(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "initial_backoff_ms must not exceed max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

// Exponential backoff with jitter
pub fn calculate_backoff(retry_attempt: u32, config: &RetryConfig) -> Duration {
    let base_backoff_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powf(retry_attempt as f64))
    .min(config.max_backoff_ms as f64);

    // Apply jitter to prevent thundering herd
    let jitter = rand::random::<f64>() * config.jitter_factor * base_backoff_ms;
    let backoff_ms = base_backoff_ms * (1.0 - config.jitter_factor / 2.0) + jitter;

    Duration::from_millis(backoff_ms as u64)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    // Tokens closer than this to expiry are refreshed before being handed out
    pub refresh_margin_ms: u64,
    pub request_queue_capacity: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_margin_ms: 30_000,
            request_queue_capacity: 64,
        }
    }
}

impl TokenConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "token.request_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_millis(self.refresh_margin_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub queue_capacity: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_capacity: 256,
        }
    }
}

impl ArchiveConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "archive.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_vendor_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_vendor_timeout_ms() -> u64 {
    5000
}

impl VendorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "vendor.base_url must be an http(s) url, got {:?}",
                self.base_url
            )));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::Invalid("vendor.client_id is empty".to_string()));
        }
        Ok(())
    }
}
