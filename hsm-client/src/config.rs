//! # Client Configuration
//!
//! Serde-backed settings for the HSM endpoint, framing, retries and pool,
//! with the defaults and bounds the service has always enforced.

use std::path::Path;
use std::time::Duration;

use hsm_common::{FrameCodec, MAX_HEADER_WIDTH};
use serde::{Deserialize, Serialize};

use crate::connection::{TcpConnector, ValidityPolicy};
use crate::executor::RetryPolicy;
use crate::pool::PoolConfig;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Configuration for the client and its pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// HSM host name or IP address.
    pub host: String,
    pub port: u16,
    /// Socket read/write timeout.
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Frame header width in hex digits.
    pub header_length: u8,
    /// Attempts per command, including the first.
    pub max_retries: u32,
    /// Backoff step; attempt `a` is followed by a sleep of `a * step`.
    pub retry_base_delay_ms: u64,
    pub pool: PoolSettings,
}

/// Pool section of [`ClientConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Warm-up below this many connections is reported as an error.
    pub min_size: usize,
    /// Fixed pool capacity.
    pub max_size: usize,
    pub max_idle_time_ms: u64,
    pub max_age_ms: u64,
    pub borrow_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 1500,
            timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            header_length: 4,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            pool: PoolSettings::default(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            min_size: 2,
            max_size: 5,
            max_idle_time_ms: 300_000,
            max_age_ms: 1_800_000,
            borrow_timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks every field, returning the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(invalid("host", "must not be blank"));
        }
        if self.port == 0 {
            return Err(invalid("port", "must be between 1 and 65535"));
        }
        if self.timeout_ms < 1_000 {
            return Err(invalid("timeout_ms", "must be at least 1000"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("connect_timeout_ms", "must be positive"));
        }
        if self.header_length == 0 || self.header_length > MAX_HEADER_WIDTH {
            return Err(invalid(
                "header_length",
                format!("must be between 1 and {}", MAX_HEADER_WIDTH),
            ));
        }
        if self.max_retries == 0 {
            return Err(invalid("max_retries", "must be at least 1"));
        }

        let pool = &self.pool;
        if pool.max_size == 0 {
            return Err(invalid("pool.max_size", "must be at least 1"));
        }
        if pool.min_size == 0 || pool.min_size > pool.max_size {
            return Err(invalid("pool.min_size", "must be between 1 and pool.max_size"));
        }
        if pool.max_idle_time_ms < 60_000 {
            return Err(invalid("pool.max_idle_time_ms", "must be at least 60000"));
        }
        if pool.max_age_ms < pool.max_idle_time_ms {
            return Err(invalid("pool.max_age_ms", "must not be below pool.max_idle_time_ms"));
        }
        if pool.borrow_timeout_ms == 0 {
            return Err(invalid("pool.borrow_timeout_ms", "must be positive"));
        }
        Ok(())
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.header_length)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            capacity: self.pool.max_size,
            min_size: self.pool.min_size,
            borrow_timeout: Duration::from_millis(self.pool.borrow_timeout_ms),
            validity: ValidityPolicy {
                max_age: Duration::from_millis(self.pool.max_age_ms),
                max_idle: Duration::from_millis(self.pool.max_idle_time_ms),
            },
        }
    }

    /// TCP factory for the configured endpoint.
    pub fn connector(&self) -> TcpConnector {
        TcpConnector {
            host: self.host.clone(),
            port: self.port,
            connect_timeout: Some(Duration::from_millis(self.connect_timeout_ms)),
            io_timeout: Some(Duration::from_millis(self.timeout_ms)),
        }
    }
}
