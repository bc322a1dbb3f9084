//! Engine configuration
//!
//! Limits and fairness knobs for the engine, read from a JSON file whose path
//! is given by the `QSIB_SENSOR_CONFIG` environment variable. Every field is
//! optional; anything missing (or the whole file) falls back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the JSON config file
pub const CONFIG_ENV_VAR: &str = "QSIB_SENSOR_CONFIG";

fn default_error_queue_capacity() -> usize {
    crate::DEFAULT_ERROR_QUEUE_CAPACITY
}

fn default_max_payload_len() -> usize {
    crate::DEFAULT_MAX_PAYLOAD_LEN
}

fn default_max_measurements() -> usize {
    usize::MAX
}

fn default_max_samples_per_modality() -> u64 {
    u64::from(u32::MAX - 255)
}

fn default_max_idle_buffers() -> usize {
    8
}

fn default_reader_admission_budget() -> u32 {
    32
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Pending diagnostic messages kept before the oldest is overwritten
    #[serde(default = "default_error_queue_capacity")]
    pub error_queue_capacity: usize,
    /// Largest accepted notification payload in bytes
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,
    /// Live measurements allowed at once; unlimited unless configured
    #[serde(default = "default_max_measurements")]
    pub max_measurements: usize,
    /// Samples a single modality may accumulate
    #[serde(default = "default_max_samples_per_modality")]
    pub max_samples_per_modality: u64,
    /// Returned export buffers kept around for reuse
    #[serde(default = "default_max_idle_buffers")]
    pub max_idle_buffers: usize,
    /// Readers admitted past a waiting writer before readers start queueing
    #[serde(default = "default_reader_admission_budget")]
    pub reader_admission_budget: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            error_queue_capacity: default_error_queue_capacity(),
            max_payload_len: default_max_payload_len(),
            max_measurements: default_max_measurements(),
            max_samples_per_modality: default_max_samples_per_modality(),
            max_idle_buffers: default_max_idle_buffers(),
            reader_admission_budget: default_reader_admission_budget(),
        }
    }
}

impl EngineConfig {
    /// Config file path from `QSIB_SENSOR_CONFIG`, if set
    pub fn path() -> Option<PathBuf> {
        std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from)
    }

    /// Load config from the environment, falling back to defaults on any error
    pub fn load() -> Self {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::debug!("{} not set, using default config", CONFIG_ENV_VAR);
                Self::default()
            }
        }
    }

    /// Load config from a specific file, falling back to defaults on any error
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    config.sanitized()
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read config, using defaults");
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }

    /// Clamp values that would make the engine unusable
    pub fn sanitized(mut self) -> Self {
        // ArrayQueue cannot be built with zero capacity
        self.error_queue_capacity = self.error_queue_capacity.max(1);
        // The header alone is 8 bytes and the wire length field is a u16
        self.max_payload_len = self
            .max_payload_len
            .clamp(crate::signal::payload::HEADER_LEN + 1, usize::from(u16::MAX));
        self.max_measurements = self.max_measurements.max(1);
        self.reader_admission_budget = self.reader_admission_budget.max(1);
        self
    }
}
