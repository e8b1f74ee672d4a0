//! Server configuration
//!
//! [`ServerConfig`] is built in code or loaded from a JSON file. Every field
//! has a default, so a config file only needs the keys it changes:
//!
//! ```json
//! { "sessionTimeoutMs": 120000, "maxClientsPerChannel": 8 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunables of a [`Server`](crate::server::Server)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// How long a session may stay client-less before it is evicted
    pub session_timeout_ms: u64,
    /// How often the idle-session reaper runs
    pub reaper_interval_ms: u64,
    /// Maximum links per session channel (0 = unlimited)
    pub max_clients_per_channel: usize,
    /// Queries whose argument text exceeds this many bytes are dropped
    pub max_argument_bytes: usize,
    /// Broadcast application errors to clients as console events
    pub console_errors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 60_000,
            reaper_interval_ms: 5_000,
            max_clients_per_channel: 0,
            max_argument_bytes: 1024 * 1024, // 1MB
            console_errors: true,
        }
    }
}

impl ServerConfig {
    /// Parse a config from JSON text
    pub fn load(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("failed to parse server config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::load(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reaper_interval_ms == 0 {
            return Err(Error::Config("reaperIntervalMs must be positive".into()));
        }
        if self.max_argument_bytes == 0 {
            return Err(Error::Config("maxArgumentBytes must be positive".into()));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients_per_channel = max;
        self
    }
}
