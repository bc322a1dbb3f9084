//! QSIB Sensor Core - measurement store, timestamp reconstruction, and export
//!
//! This library ingests notification payloads streamed from QSIB biosensors,
//! reconstructs device-clock timestamps from rolling notification counters,
//! and serves downsampled trailing windows of the stored signals through
//! reusable export buffers.
//!
//! The C boundary lives in the `qsib-sensor` crate; everything here is safe
//! Rust and usable directly.

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod export;
pub mod signal;
pub mod store;

pub use config::EngineConfig;
pub use diagnostics::ErrorQueue;
pub use engine::SensorEngine;
pub use error::{Result, SensorError};
pub use export::buffer::{ExportBufferPool, ExportLease};
pub use signal::downsample::Downsampler;
pub use signal::payload::{Header, Notification};
pub use store::measurement::{ConsumeOutcome, ExportParams, MeasurementSummary};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Date the library was built (set by build.rs)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Number of pending diagnostic messages kept before the oldest is dropped
pub const DEFAULT_ERROR_QUEUE_CAPACITY: usize = 16;

/// Largest payload accepted from a sensor notification, in bytes
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 512;

/// Human readable version string handed across the C boundary
pub fn version_string() -> String {
    format!("qsib-sensor {} (built {})", VERSION, BUILD_DATE)
}
