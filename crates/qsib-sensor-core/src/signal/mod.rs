//! Signal processing module
//!
//! Pure, lock-free building blocks of the ingestion and export paths:
//! - Notification payload decoding ([`payload`])
//! - Wire-slot to durable modality mapping ([`modality`])
//! - Device-clock timestamp reconstruction ([`timestamp`])
//! - Deterministic seeded downsampling ([`downsample`])

pub mod downsample;
pub mod modality;
pub mod payload;
pub mod timestamp;
