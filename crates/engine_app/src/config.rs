//! Engine configuration, loaded from JSON.

use std::collections::HashMap;
use std::path::Path;

use engine_system::{SystemConfig, SystemOverrides};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Top-level engine configuration.
///
/// Every field is optional in the file; missing ones take their defaults.
///
/// ```json
/// {
///   "frame_rate": 60.0,
///   "max_frames": 600,
///   "log_filter": "info,engine_system=debug",
///   "systems": {
///     "mechanics": { "cadence": { "mode": "fixed", "hz": 240.0 } },
///     "display": { "queue_capacity": 256, "dependencies": ["mechanics"] }
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Target frames per second of the engine loop.
    pub frame_rate: f64,
    /// Stop after this many frames (0 = unlimited).
    pub max_frames: u64,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Per-system overrides, keyed by system name.
    pub systems: HashMap<String, SystemOverrides>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_rate: 60.0,
            max_frames: 0,
            log_filter: "info".to_string(),
            systems: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Read a config file.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConfigIo`] if the file cannot be read, or
    /// [`EngineError::ConfigParse`] if it is not a valid config.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| EngineError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The config for the system called `name`, with any overrides applied.
    #[must_use]
    pub fn system_config(&self, name: &str) -> SystemConfig {
        let mut config = SystemConfig::new(name);
        if let Some(overrides) = self.systems.get(name) {
            config.apply(overrides);
        }
        config
    }
}
