//! Engine facade
//!
//! Owns the measurement registry, the export buffer pool, and the diagnostic
//! queue. Every failed operation is logged and leaves one message on the
//! queue before the error is handed back.

use crate::config::EngineConfig;
use crate::diagnostics::ErrorQueue;
use crate::error::{Result, SensorError};
use crate::export::buffer::{ExportBufferPool, ExportLease};
use crate::store::measurement::{ConsumeOutcome, ExportParams, MeasurementSummary};
use crate::store::registry::MeasurementRegistry;
use crate::store::StoreLimits;

/// Sensor ingestion and export engine
#[derive(Debug)]
pub struct SensorEngine {
    config: EngineConfig,
    registry: MeasurementRegistry,
    pool: ExportBufferPool,
    errors: ErrorQueue,
}

impl SensorEngine {
    /// Create an engine with the given configuration
    pub fn new(config: EngineConfig) -> Self {
        let config = config.sanitized();
        tracing::debug!(?config, "Sensor engine created");
        Self {
            registry: MeasurementRegistry::new(StoreLimits::from(&config)),
            pool: ExportBufferPool::new(config.max_idle_buffers),
            errors: ErrorQueue::new(config.error_queue_capacity),
            config,
        }
    }

    /// Create an engine configured from `QSIB_SENSOR_CONFIG`
    pub fn from_env() -> Self {
        Self::new(EngineConfig::load())
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create an empty measurement
    ///
    /// # Returns
    /// Its id, never 0
    pub fn create_measurement(&self) -> Result<u32> {
        self.record("create_measurement", self.registry.create())
    }

    /// Drop a measurement and free its storage
    pub fn drop_measurement(&self, measurement_id: u32) -> Result<()> {
        self.record("drop_measurement", self.registry.remove(measurement_id))
    }

    /// Ingest one notification payload
    ///
    /// # Arguments
    /// * `measurement_id` - Target measurement
    /// * `payload` - Raw notification bytes
    pub fn consume(&self, measurement_id: u32, payload: &[u8]) -> Result<ConsumeOutcome> {
        let result = self
            .registry
            .get(measurement_id)
            .and_then(|m| m.consume(payload, self.registry.limits()));
        self.record("consume", result)
    }

    /// Export a window of a modality into a checked-out buffer
    ///
    /// # Arguments
    /// * `measurement_id` - Source measurement
    /// * `modality_id` - Durable modality id from [`Self::consume`]
    /// * `params` - Rate, trailing window, and downsampling
    ///
    /// # Returns
    /// A lease that stays readable until returned
    pub fn export(
        &self,
        measurement_id: u32,
        modality_id: u64,
        params: &ExportParams,
    ) -> Result<ExportLease> {
        let result = self.registry.get(measurement_id).and_then(|m| {
            let channels = m.channel_count(modality_id)?;
            self.pool
                .fill(channels, |buffer| m.export_into(modality_id, params, buffer))
        });
        if let Ok(lease) = &result {
            tracing::debug!(
                measurement = measurement_id,
                modality = modality_id,
                buffer_id = lease.buffer_id(),
                samples = lease.num_samples(),
                "Export checked out"
            );
        }
        self.record("export", result)
    }

    /// Return an export buffer by id
    pub fn return_buffer(&self, buffer_id: u32) -> Result<()> {
        self.record("return_buffer", self.pool.return_buffer(buffer_id))
    }

    /// Return the buffer behind a lease
    pub fn return_lease(&self, lease: ExportLease) -> Result<()> {
        self.record("return_buffer", self.pool.return_lease(lease))
    }

    /// Retire an active modality so its wire type starts a new one
    pub fn retire_modality(&self, measurement_id: u32, modality_id: u64) -> Result<()> {
        let result = self
            .registry
            .get(measurement_id)
            .and_then(|m| m.retire(modality_id));
        self.record("retire_modality", result)
    }

    /// Reporting snapshot of a measurement
    pub fn summary(&self, measurement_id: u32) -> Result<MeasurementSummary> {
        let result = self.registry.get(measurement_id).and_then(|m| m.summary());
        self.record("summary", result)
    }

    /// Pop the oldest pending diagnostic message
    pub fn pop_error(&self) -> Option<String> {
        self.errors.pop()
    }

    /// Diagnostic queue
    pub fn errors(&self) -> &ErrorQueue {
        &self.errors
    }

    /// Report a failure that happened outside the engine's own operations
    pub fn report(&self, operation: &'static str, error: SensorError) {
        tracing::warn!(operation, error = %error, "Operation failed");
        self.errors.push(error.to_string());
    }

    /// Number of live measurements
    pub fn measurement_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of export buffers not yet returned
    pub fn buffers_checked_out(&self) -> usize {
        self.pool.checked_out()
    }

    fn record<T>(&self, operation: &'static str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.report(operation, e.clone());
        }
        result
    }
}

impl Default for SensorEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
