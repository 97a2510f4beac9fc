//! Client-wide and per-downlink configuration.
//!
//! `ClientConfig` is usually loaded from a JSON document; every field is
//! optional and falls back to its default:
//!
//! ```json
//! {
//!   "linked_timeout_ms": 30000,
//!   "unlink_timeout_ms": 5000,
//!   "tick_interval_ms": 250,
//!   "outbound_queue_warn": 1024,
//!   "reconnect": { "min_delay_ms": 500, "max_delay_ms": 30000 }
//! }
//! ```

use crate::error::ConfigError;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long events may stay buffered waiting for `linked` before the link fails.
    pub linked_timeout_ms: u64,
    /// How long a model waits in `Unlinking` for the `unlinked` ack.
    pub unlink_timeout_ms: u64,
    /// Period of the host driver's timeout sweep.
    pub tick_interval_ms: u64,
    /// Outbound queue depth above which a warning is logged.
    pub outbound_queue_warn: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            linked_timeout_ms: 30_000,
            unlink_timeout_ms: 5_000,
            tick_interval_ms: 250,
            outbound_queue_warn: 1024,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("loading client config from {path:?}");
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&data)
    }

    pub fn linked_timeout(&self) -> Duration {
        Duration::from_millis(self.linked_timeout_ms)
    }

    pub fn unlink_timeout(&self) -> Duration {
        Duration::from_millis(self.unlink_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Link settings of one downlink model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownlinkConfig {
    /// Re-link after a server unlink or reconnect, and stay linked with no handles.
    pub keep_linked: bool,
    /// Request `sync` (full state) instead of a bare `link`.
    pub keep_synced: bool,
    pub priority: f64,
    pub rate: f64,
    /// Body sent with `link` / `sync`.
    pub body: Option<Value>,
}

impl Default for DownlinkConfig {
    fn default() -> Self {
        Self {
            keep_linked: true,
            keep_synced: true,
            priority: 0.0,
            rate: 0.0,
            body: None,
        }
    }
}
