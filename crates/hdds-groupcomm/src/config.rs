// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Group server configuration.

use crate::server::HeartbeatConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Group server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on (default: 8888)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Interval between ping sweeps (seconds)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Silence after which a member is removed (seconds)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum number of group members
    #[serde(default = "default_max_members")]
    pub max_members: usize,

    /// Maximum member id length (characters)
    #[serde(default = "default_max_id_length")]
    pub max_id_length: usize,

    /// Maximum length of a received line (bytes)
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Lines buffered per connection before sends to it start failing
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8888
}

fn default_ping_interval() -> u64 {
    20
}

fn default_timeout() -> u64 {
    40
}

fn default_max_members() -> usize {
    1000
}

fn default_max_id_length() -> usize {
    32
}

fn default_max_line_length() -> usize {
    64 * 1024
}

fn default_outbound_queue_capacity() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            ping_interval_secs: default_ping_interval(),
            timeout_secs: default_timeout(),
            max_members: default_max_members(),
            max_id_length: default_max_id_length(),
            max_line_length: default_max_line_length(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            ping_interval: self.ping_interval(),
            timeout: self.timeout(),
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.ping_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "ping_interval_secs cannot be 0".into(),
            ));
        }
        if self.timeout_secs < self.ping_interval_secs {
            return Err(ConfigError::InvalidValue(format!(
                "timeout_secs ({}) must be at least ping_interval_secs ({})",
                self.timeout_secs, self.ping_interval_secs
            )));
        }
        if self.max_members == 0 {
            return Err(ConfigError::InvalidValue("max_members cannot be 0".into()));
        }
        if self.max_id_length == 0 {
            return Err(ConfigError::InvalidValue(
                "max_id_length cannot be 0".into(),
            ));
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::InvalidValue(
                "max_line_length cannot be 0".into(),
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "outbound_queue_capacity cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
