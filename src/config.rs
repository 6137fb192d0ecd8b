//! Configuration management for Procsi
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from the optional project config file and environment
//! variables. All knobs have conservative defaults; a daemon started in a
//! bare project runs without any configuration file at all.

use crate::error::{ProcsiError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for the daemon
///
/// Holds all tunables for the proxy engine, the request repository,
/// the interceptor runtime, and the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Proxy engine configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Request repository configuration
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Interceptor runtime configuration
    #[serde(default)]
    pub interceptors: InterceptorConfig,

    /// Event log configuration
    #[serde(default)]
    pub events: EventLogConfig,
}

/// Proxy engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Preferred listen port; `0` lets the OS pick
    #[serde(default)]
    pub port: u16,

    /// Bodies above this size are stored truncated
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

/// Request repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Cap on non-bookmarked stored requests before eviction kicks in
    #[serde(default = "default_max_stored_requests")]
    pub max_stored_requests: u64,
}

/// Interceptor runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptorConfig {
    /// Bound on a single `matches()` invocation
    #[serde(default = "default_match_timeout_ms")]
    pub match_timeout_ms: u64,

    /// Bound on each handler phase (request and response)
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
}

/// Event log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Ring capacity; the oldest event is dropped past this point
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 0,
            max_body_size: default_max_body_size(),
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_stored_requests: default_max_stored_requests(),
        }
    }
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            match_timeout_ms: default_match_timeout_ms(),
            handler_timeout_ms: default_handler_timeout_ms(),
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            repository: RepositoryConfig::default(),
            interceptors: InterceptorConfig::default(),
            events: EventLogConfig::default(),
        }
    }
}

fn default_max_body_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_max_stored_requests() -> u64 {
    5000
}

fn default_match_timeout_ms() -> u64 {
    1000
}

fn default_handler_timeout_ms() -> u64 {
    10_000
}

fn default_event_capacity() -> usize {
    1000
}

impl Config {
    /// Load configuration from a YAML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProcsiError::Config(format!("Failed to read {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| ProcsiError::Config(format!("Failed to parse {}: {e}", path.display())))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.proxy.max_body_size == 0 {
            return Err(ProcsiError::Config("proxy.max_body_size must be positive".into()).into());
        }
        if self.repository.max_stored_requests == 0 {
            return Err(ProcsiError::Config(
                "repository.max_stored_requests must be positive".into(),
            )
            .into());
        }
        if self.interceptors.match_timeout_ms == 0 || self.interceptors.handler_timeout_ms == 0 {
            return Err(ProcsiError::Config("interceptor timeouts must be positive".into()).into());
        }
        if self.events.capacity == 0 {
            return Err(ProcsiError::Config("events.capacity must be positive".into()).into());
        }
        Ok(())
    }
}
