//! Shell settings — optional JSON file, every field defaulted.
//!
//! ```json
//! {
//!   "participant_id": "ada",
//!   "display_name": "Ada",
//!   "store_path": "devcollab_queue",
//!   "signaling_url": "ws://127.0.0.1:9001",
//!   "remote_url": "ws://127.0.0.1:9002",
//!   "start_online": false,
//!   "max_attempts": 5
//! }
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

use devcollab_sync::{Identity, NegotiatorConfig, QueueConfig, StoreConfig};

pub const DEFAULT_SETTINGS_FILE: &str = "devcollab.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Falls back to an anonymous identity when unset
    pub participant_id: Option<String>,
    pub display_name: Option<String>,
    pub store_path: PathBuf,
    /// No signaling server: calls stay local and never connect
    pub signaling_url: Option<String>,
    /// No write endpoint: writes are acknowledged in-process
    pub remote_url: Option<String>,
    pub start_online: bool,
    pub max_attempts: u32,
    pub submit_timeout_ms: u64,
    pub negotiation_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let queue = QueueConfig::default();
        let negotiator = NegotiatorConfig::default();
        Self {
            participant_id: None,
            display_name: None,
            store_path: StoreConfig::default().path,
            signaling_url: None,
            remote_url: None,
            start_online: true,
            max_attempts: queue.max_attempts,
            submit_timeout_ms: queue.submit_timeout_ms,
            negotiation_timeout_ms: negotiator.negotiation_timeout_ms,
            sweep_interval_ms: negotiator.sweep_interval_ms,
        }
    }
}

/// Settings load errors.
#[derive(Debug)]
pub enum SettingsError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Io(e) => write!(f, "Cannot read settings: {e}"),
            SettingsError::Parse(e) => write!(f, "Invalid settings: {e}"),
        }
    }
}

impl std::error::Error for SettingsError {}

impl Settings {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(SettingsError::Parse),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No settings at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(SettingsError::Io(e)),
        }
    }

    pub fn identity(&self) -> Identity {
        match &self.participant_id {
            Some(id) => Identity::new(id.clone(), self.display_name.clone().unwrap_or_else(|| id.clone())),
            None => Identity::anonymous(),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.store_path.clone(),
            ..StoreConfig::default()
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_attempts: self.max_attempts.max(1),
            submit_timeout_ms: self.submit_timeout_ms,
        }
    }

    pub fn negotiator_config(&self) -> NegotiatorConfig {
        NegotiatorConfig {
            negotiation_timeout_ms: self.negotiation_timeout_ms,
            sweep_interval_ms: self.sweep_interval_ms,
        }
    }
}
