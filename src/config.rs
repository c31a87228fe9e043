//! Configuration of the replication client: loading from TOML and validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::model::ClientIdentity;

/// A configuration value that cannot work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("activity_fetch_batch_size cannot be 0")]
    ZeroBatchSize,

    #[error("event_channel_capacity cannot be 0")]
    ZeroEventCapacity,

    #[error("tick_interval_ms cannot be 0")]
    ZeroTickInterval,

    #[error("introspection port cannot be 0 when introspection is enabled")]
    ZeroIntrospectionPort,

    #[error("introspection host cannot be empty")]
    EmptyIntrospectionHost,

    #[error("local display name cannot be empty")]
    EmptyDisplayName,
}

/// The read-only HTTP endpoint exposing client and authority state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IntrospectionConfig {
    #[serde(default = "default_introspection_enabled")]
    pub enabled: bool,
    #[serde(default = "default_introspection_host")]
    pub host: String,
    #[serde(default = "default_introspection_port")]
    pub port: u16,
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self {
            enabled: default_introspection_enabled(),
            host: default_introspection_host(),
            port: default_introspection_port(),
        }
    }
}

/// Who the local client claims to be when it connects.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentityConfig {
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

impl Default for LocalIdentityConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            device_name: default_device_name(),
        }
    }
}

impl LocalIdentityConfig {
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::new(&self.display_name, &self.device_name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Number of activities fetched per request when scanning the session history.
    #[serde(default = "default_activity_fetch_batch_size")]
    pub activity_fetch_batch_size: usize,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// How often the host flushes deferred work.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub introspection: IntrospectionConfig,
    #[serde(default)]
    pub local_identity: LocalIdentityConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_activity_fetch_batch_size() -> usize {
    crate::offline::DEFAULT_ACTIVITY_BATCH_SIZE
}
fn default_event_channel_capacity() -> usize {
    crate::events::DEFAULT_EVENT_CHANNEL_CAPACITY
}
fn default_tick_interval_ms() -> u64 {
    16 // one frame at 60 Hz
}
fn default_introspection_enabled() -> bool {
    true
}
fn default_introspection_host() -> String {
    "127.0.0.1".to_string()
}
fn default_introspection_port() -> u16 {
    3000
}
fn default_display_name() -> String {
    "Editor".to_string()
}
fn default_device_name() -> String {
    "localhost".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            activity_fetch_batch_size: default_activity_fetch_batch_size(),
            event_channel_capacity: default_event_channel_capacity(),
            tick_interval_ms: default_tick_interval_ms(),
            introspection: IntrospectionConfig::default(),
            local_identity: LocalIdentityConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Loads and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{}'", path.display()))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config in '{}'", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: ReplicationConfig =
            toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.activity_fetch_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::ZeroEventCapacity);
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::ZeroTickInterval);
        }
        if self.introspection.enabled {
            if self.introspection.port == 0 {
                return Err(ConfigError::ZeroIntrospectionPort);
            }
            if self.introspection.host.trim().is_empty() {
                return Err(ConfigError::EmptyIntrospectionHost);
            }
        }
        if self.local_identity.display_name.trim().is_empty() {
            return Err(ConfigError::EmptyDisplayName);
        }
        if self.event_channel_capacity < 16 {
            warn!(
                capacity = self.event_channel_capacity,
                "Small event channel; slow subscribers will miss events"
            );
        }
        Ok(())
    }
}
