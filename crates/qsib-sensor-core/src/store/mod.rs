//! Measurement storage
//!
//! - Reader-biased per-measurement locking ([`lock`])
//! - Per-measurement modalities and sample buffers ([`measurement`])
//! - Process-wide id to measurement mapping ([`registry`])

pub mod lock;
pub mod measurement;
pub mod registry;

use crate::config::EngineConfig;

/// Limits applied to every measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Largest accepted payload in bytes
    pub max_payload_len: usize,
    /// Samples a single modality may hold
    pub max_samples_per_modality: u64,
    /// Live measurements allowed at once
    pub max_measurements: usize,
    /// Readers allowed to overtake a waiting writer
    pub reader_admission_budget: u32,
}

impl From<&EngineConfig> for StoreLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_payload_len: config.max_payload_len,
            max_samples_per_modality: config.max_samples_per_modality,
            max_measurements: config.max_measurements,
            reader_admission_budget: config.reader_admission_budget,
        }
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}
