//! Process-wide measurement registry

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::measurement::Measurement;
use super::StoreLimits;
use crate::error::{Result, SensorError};

#[derive(Debug)]
struct RegistryInner {
    measurements: HashMap<u32, Arc<Measurement>>,
    /// Candidate for the next id; 0 is never handed out
    next_id: u32,
}

/// Map from measurement id to measurement
///
/// Lookups take the read lock only long enough to clone an `Arc`, so work on
/// one measurement never blocks lookups of another.
#[derive(Debug)]
pub struct MeasurementRegistry {
    inner: RwLock<RegistryInner>,
    limits: StoreLimits,
}

impl MeasurementRegistry {
    /// Create an empty registry
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                measurements: HashMap::new(),
                next_id: 1,
            }),
            limits,
        }
    }

    /// Limits applied to measurements created here
    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    /// Create a measurement and return its id
    ///
    /// Ids are never 0 and never collide with a live measurement.
    pub fn create(&self) -> Result<u32> {
        let mut inner = self.inner.write();
        if inner.measurements.len() >= self.limits.max_measurements {
            return Err(SensorError::AllocationFailure(format!(
                "measurement limit of {} reached",
                self.limits.max_measurements
            )));
        }

        let mut id = inner.next_id;
        while id == 0 || inner.measurements.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);

        inner.measurements.try_reserve(1)?;
        inner
            .measurements
            .insert(id, Arc::new(Measurement::new(id, &self.limits)));

        tracing::info!(
            measurement = id,
            live = inner.measurements.len(),
            "Measurement created"
        );
        Ok(id)
    }

    /// Look up a live measurement
    pub fn get(&self, id: u32) -> Result<Arc<Measurement>> {
        self.inner
            .read()
            .measurements
            .get(&id)
            .cloned()
            .ok_or(SensorError::UnknownMeasurement(id))
    }

    /// Remove a measurement and free its storage
    ///
    /// Waits for operations already running on the measurement. Operations
    /// that looked it up before removal but have not started yet fail with
    /// [`SensorError::UnknownMeasurement`].
    pub fn remove(&self, id: u32) -> Result<()> {
        let measurement = self
            .inner
            .write()
            .measurements
            .remove(&id)
            .ok_or(SensorError::UnknownMeasurement(id))?;

        measurement.release();
        tracing::info!(measurement = id, "Measurement dropped");
        Ok(())
    }

    /// Number of live measurements
    pub fn len(&self) -> usize {
        self.inner.read().measurements.len()
    }

    /// Whether no measurement is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all live measurements, ascending
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.inner.read().measurements.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for MeasurementRegistry {
    fn default() -> Self {
        Self::new(StoreLimits::default())
    }
}
