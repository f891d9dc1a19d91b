//! Runtime configuration for the orchestration core
//!
//! Settings are loaded from TOML. Every field has a default, so an empty file
//! (or [`ConductorConfig::default`]) yields the reference behavior.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration covering the context manager, message bus, and orchestrator
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConductorConfig {
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

/// Context manager settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSection {
    /// Expiration applied to root contexts when none is given (default: 24h)
    #[serde(default = "default_expiration_secs")]
    pub default_expiration_secs: u64,
    /// Expiration applied to persisted agent contexts (default: 1h)
    #[serde(default = "default_agent_context_expiration_secs")]
    pub agent_context_expiration_secs: u64,
    /// Interval of the background expiry sweep (default: 5 minutes)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Clone/share lineage entries kept per base context by `optimize_storage`
    #[serde(default = "default_max_lineage")]
    pub max_lineage: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            default_expiration_secs: default_expiration_secs(),
            agent_context_expiration_secs: default_agent_context_expiration_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_lineage: default_max_lineage(),
        }
    }
}

impl ContextSection {
    pub fn default_expiration(&self) -> Duration {
        Duration::from_secs(self.default_expiration_secs)
    }

    pub fn agent_context_expiration(&self) -> Duration {
        Duration::from_secs(self.agent_context_expiration_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Message bus settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusSection {
    /// Capacity of the message history ring buffer (default: 1000)
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Default timeout for request/response exchanges (default: 30000)
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Consecutive failures before an agent's circuit opens (default: 3)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cool-down before an open circuit half-opens (default: 30000)
    #[serde(default = "default_circuit_cooldown_ms")]
    pub circuit_cooldown_ms: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            request_timeout_ms: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            circuit_cooldown_ms: default_circuit_cooldown_ms(),
        }
    }
}

impl BusSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_cooldown_ms)
    }
}

/// Pipeline orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorSection {
    /// Terminal pipeline records kept in history (default: 1000)
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Buffered lifecycle events per subscriber (default: 256)
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_expiration_secs() -> u64 {
    24 * 60 * 60
}

fn default_agent_context_expiration_secs() -> u64 {
    60 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}

fn default_max_lineage() -> usize {
    3
}

fn default_history_capacity() -> usize {
    1000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_circuit_cooldown_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    256
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConductorConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ConductorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable core guarantees
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.history_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "bus.history_capacity must be greater than 0".to_string(),
            ));
        }
        if self.bus.failure_threshold == 0 {
            return Err(ConfigError::InvalidConfig(
                "bus.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.context.cleanup_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "context.cleanup_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.orchestrator.event_buffer == 0 {
            return Err(ConfigError::InvalidConfig(
                "orchestrator.event_buffer must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
