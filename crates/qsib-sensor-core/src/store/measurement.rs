//! Per-measurement modality and sample storage
//!
//! Samples are stored raw, one append-only vector per channel, next to the
//! arrival records needed to rebuild their timestamps. Nothing derived from
//! export parameters is persisted, so one measurement can be exported at any
//! rate, window, or downsampling without re-ingesting.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::lock::ReaderBiasedLock;
use super::StoreLimits;
use crate::error::{Result, SensorError};
use crate::export::buffer::ExportBuffer;
use crate::signal::downsample::Downsampler;
use crate::signal::modality::{Assignment, ModalityTracker, Shape};
use crate::signal::payload::{self, Notification};
use crate::signal::timestamp::{self, ArrivalRecord, CounterStep, SampleClock, Timeline};

/// Result of consuming one payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    /// Durable modality the samples were appended to
    pub modality_id: u64,
    /// On-wire modality type of the payload
    pub modality_type: u8,
    /// Channels per sample
    pub channels: u8,
    /// Samples per channel consumed
    pub sample_count: u32,
}

/// Parameters of one export
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportParams {
    /// Nominal sampling rate in Hz
    pub hz: f32,
    /// Multiplier on the 1 second period of `hz`
    pub rate_scaler: f32,
    /// Key for the downsampling draws
    pub downsample_seed: u64,
    /// Inclusive acceptance bound; negative keeps every sample
    pub downsample_threshold: i64,
    /// Modulus of the downsampling draws; zero keeps every sample
    pub downsample_scale: u64,
    /// Trailing window in seconds; zero, negative, or non-finite means all data
    pub trailing_s: f32,
}

impl ExportParams {
    /// Export every sample at `hz`
    pub fn all(hz: f32) -> Self {
        Self {
            hz,
            rate_scaler: 1.0,
            downsample_seed: 0,
            downsample_threshold: -1,
            downsample_scale: 0,
            trailing_s: 0.0,
        }
    }

    /// Limit the export to the trailing `seconds` of device time
    pub fn trailing(mut self, seconds: f32) -> Self {
        self.trailing_s = seconds;
        self
    }

    /// Downsample with the given seed, threshold, and scale
    pub fn downsampled(mut self, seed: u64, threshold: i64, scale: u64) -> Self {
        self.downsample_seed = seed;
        self.downsample_threshold = threshold;
        self.downsample_scale = scale;
        self
    }

    fn downsampler(&self) -> Downsampler {
        Downsampler::new(
            self.downsample_seed,
            self.downsample_threshold,
            self.downsample_scale,
        )
    }

    fn window(&self) -> Option<f64> {
        (self.trailing_s.is_finite() && self.trailing_s > 0.0).then(|| f64::from(self.trailing_s))
    }
}

/// Snapshot of one modality for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModalitySummary {
    pub id: u64,
    pub modality_type: u8,
    pub channels: u8,
    pub sample_width: u8,
    pub active: bool,
    pub notifications: u64,
    pub samples: u64,
    pub missed_notifications: u64,
}

/// Snapshot of one measurement for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeasurementSummary {
    pub id: u32,
    pub created_at: DateTime<Utc>,
    pub last_consumed_at: Option<DateTime<Utc>>,
    pub payloads: u64,
    pub bytes: u64,
    pub samples: u64,
    pub modalities: Vec<ModalitySummary>,
}

/// Stored data of one modality
#[derive(Debug)]
struct ModalityData {
    id: u64,
    modality_type: u8,
    shape: Shape,
    records: Vec<ArrivalRecord>,
    /// One vector per channel, all the same length
    channels: Vec<Vec<i32>>,
    missed_notifications: u64,
}

impl ModalityData {
    fn new(id: u64, notification: &Notification) -> Self {
        let header = &notification.header;
        Self {
            id,
            modality_type: header.modality_type,
            shape: Shape::from(header),
            records: Vec::new(),
            channels: vec![Vec::new(); usize::from(header.channels)],
            missed_notifications: 0,
        }
    }

    fn sample_count(&self) -> u64 {
        self.channels.first().map(|c| c.len() as u64).unwrap_or(0)
    }

    /// Check that `notification` can be appended, reserving room for it
    ///
    /// Leaves the stored data untouched on failure.
    fn prepare(&mut self, notification: &Notification, limits: &StoreLimits) -> Result<u32> {
        let header = &notification.header;
        let missed = match self.records.last() {
            Some(last) => {
                match timestamp::classify(last.notification_counter, header.notification_counter)? {
                    CounterStep::Consecutive => 0,
                    CounterStep::Gap { missed } => missed,
                }
            }
            None => 0,
        };

        let incoming = u64::from(header.sample_count);
        if self.sample_count() + incoming > limits.max_samples_per_modality {
            return Err(SensorError::AllocationFailure(format!(
                "modality {} would exceed {} samples",
                self.id, limits.max_samples_per_modality
            )));
        }

        let additional = usize::try_from(incoming)
            .map_err(|_| SensorError::AllocationFailure("sample count overflow".into()))?;
        self.records.try_reserve(1)?;
        for channel in &mut self.channels {
            channel.try_reserve(additional)?;
        }
        Ok(missed)
    }

    /// Append a prepared notification
    fn append(&mut self, notification: &Notification, missed: u32) {
        let header = &notification.header;
        self.shape.sample_width = header.sample_width;
        self.records.push(ArrivalRecord {
            notification_counter: header.notification_counter,
            sample_count: header.sample_count,
            first_sample: self.sample_count(),
        });
        for (c, channel) in self.channels.iter_mut().enumerate() {
            channel.extend(notification.channel(c));
        }
        self.missed_notifications += u64::from(missed);
    }

    fn summary(&self, active: bool) -> ModalitySummary {
        ModalitySummary {
            id: self.id,
            modality_type: self.modality_type,
            channels: self.shape.channels,
            sample_width: self.shape.sample_width,
            active,
            notifications: self.records.len() as u64,
            samples: self.sample_count(),
            missed_notifications: self.missed_notifications,
        }
    }
}

/// Everything owned by one measurement
#[derive(Debug)]
struct MeasurementData {
    tracker: ModalityTracker,
    /// Indexed by modality id - 1
    modalities: Vec<ModalityData>,
    created_at: DateTime<Utc>,
    last_consumed_at: Option<DateTime<Utc>>,
    payloads: u64,
    bytes: u64,
    dropped: bool,
}

impl MeasurementData {
    fn new() -> Self {
        Self {
            tracker: ModalityTracker::new(),
            modalities: Vec::new(),
            created_at: Utc::now(),
            last_consumed_at: None,
            payloads: 0,
            bytes: 0,
            dropped: false,
        }
    }

    fn modality(&self, measurement: u32, modality_id: u64) -> Result<&ModalityData> {
        modality_id
            .checked_sub(1)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| self.modalities.get(i))
            .ok_or(SensorError::UnknownModality {
                measurement,
                modality: modality_id,
            })
    }
}

/// A measurement: modalities and samples behind a reader-biased lock
#[derive(Debug)]
pub struct Measurement {
    id: u32,
    data: ReaderBiasedLock<MeasurementData>,
}

impl Measurement {
    /// Create an empty measurement
    pub fn new(id: u32, limits: &StoreLimits) -> Self {
        Self {
            id,
            data: ReaderBiasedLock::new(MeasurementData::new(), limits.reader_admission_budget),
        }
    }

    /// Measurement id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Decode a payload and append its samples
    ///
    /// # Arguments
    /// * `bytes` - Raw notification payload
    /// * `limits` - Payload and storage limits
    ///
    /// # Returns
    /// Which modality received the samples. On failure the measurement is
    /// left exactly as it was.
    pub fn consume(&self, bytes: &[u8], limits: &StoreLimits) -> Result<ConsumeOutcome> {
        let notification = payload::decode(bytes, limits.max_payload_len)?;
        let header = notification.header;

        let mut data = self.data.acquire_exclusive();
        if data.dropped {
            return Err(SensorError::UnknownMeasurement(self.id));
        }

        let (slot_state, assignment) = data.tracker.plan(&header);
        let modality_id = assignment.id();

        let missed = match assignment {
            Assignment::Existing(id) => {
                let index = (id - 1) as usize;
                data.modalities[index].prepare(&notification, limits)?
            }
            Assignment::Created { id, .. } => {
                data.modalities.try_reserve(1)?;
                let mut fresh = ModalityData::new(id, &notification);
                fresh.prepare(&notification, limits)?;
                data.modalities.push(fresh);
                0
            }
        };

        // Nothing below can fail
        data.tracker.commit(&header, slot_state, assignment);
        if let Assignment::Created {
            rolled_over: Some(old),
            ..
        } = assignment
        {
            tracing::debug!(
                measurement = self.id,
                retired = old,
                modality = modality_id,
                modality_type = header.modality_type,
                channels = header.channels,
                "Modality rolled over on channel change"
            );
        } else if matches!(assignment, Assignment::Created { .. }) {
            tracing::debug!(
                measurement = self.id,
                modality = modality_id,
                modality_type = header.modality_type,
                channels = header.channels,
                "Modality created"
            );
        }

        data.modalities[(modality_id - 1) as usize].append(&notification, missed);
        if missed > 0 {
            tracing::debug!(
                measurement = self.id,
                modality = modality_id,
                counter = header.notification_counter,
                missed,
                "Missed notifications"
            );
        }

        data.payloads += 1;
        data.bytes += bytes.len() as u64;
        data.last_consumed_at = Some(Utc::now());

        tracing::trace!(
            measurement = self.id,
            modality = modality_id,
            counter = header.notification_counter,
            samples = header.sample_count,
            "Payload consumed"
        );

        Ok(ConsumeOutcome {
            modality_id,
            modality_type: header.modality_type,
            channels: header.channels,
            sample_count: header.sample_count,
        })
    }

    /// Retire an active modality so its wire type can be reused
    pub fn retire(&self, modality_id: u64) -> Result<()> {
        let mut data = self.data.acquire_exclusive();
        if data.dropped {
            return Err(SensorError::UnknownMeasurement(self.id));
        }
        data.tracker.retire(self.id, modality_id)?;
        tracing::debug!(measurement = self.id, modality = modality_id, "Modality retired");
        Ok(())
    }

    /// Channel count of a modality
    pub fn channel_count(&self, modality_id: u64) -> Result<usize> {
        let data = self.data.acquire_shared();
        if data.dropped {
            return Err(SensorError::UnknownMeasurement(self.id));
        }
        Ok(data.modality(self.id, modality_id)?.channels.len())
    }

    /// Fill `buffer` with the selected window of a modality
    ///
    /// # Arguments
    /// * `modality_id` - Durable modality to export
    /// * `params` - Rate, window, and downsampling
    /// * `buffer` - Destination, reset to the modality's channel count
    pub fn export_into(
        &self,
        modality_id: u64,
        params: &ExportParams,
        buffer: &mut ExportBuffer,
    ) -> Result<()> {
        let clock = SampleClock::new(params.hz, params.rate_scaler)?;

        let data = self.data.acquire_shared();
        if data.dropped {
            return Err(SensorError::UnknownMeasurement(self.id));
        }
        let modality = data.modality(self.id, modality_id)?;

        let timeline = Timeline::new(&modality.records, clock);
        let total = timeline.sample_count();
        let from = match (params.window(), timeline.last_timestamp()) {
            (Some(window), Some(last)) => timeline.first_sample_at_or_after(last - window),
            _ => 0,
        };

        let downsampler = params.downsampler();
        let window_len = total - from;
        let expected = if downsampler.selects_all() {
            window_len
        } else {
            let fraction = (params.downsample_threshold as f64 + 1.0) / params.downsample_scale as f64;
            ((window_len as f64 * fraction).ceil() as u64).min(window_len)
        };

        buffer.reset(modality.channels.len())?;
        buffer.reserve(usize::try_from(expected).map_err(|_| {
            SensorError::AllocationFailure(format!("{} samples do not fit in memory", expected))
        })?)?;

        let mut selected = downsampler.select(from, total).peekable();
        for (index, t) in timeline.timestamps_from(from) {
            match selected.peek() {
                Some(&next) if next == index => {
                    selected.next();
                    let i = index as usize;
                    buffer.push(t, |c| f64::from(modality.channels[c][i]))?;
                }
                Some(_) => {}
                None => break,
            }
        }

        tracing::trace!(
            measurement = self.id,
            modality = modality_id,
            window_start = from,
            total,
            exported = buffer.len(),
            "Window exported"
        );
        Ok(())
    }

    /// Reporting snapshot
    pub fn summary(&self) -> Result<MeasurementSummary> {
        let data = self.data.acquire_shared();
        if data.dropped {
            return Err(SensorError::UnknownMeasurement(self.id));
        }
        let modalities: Vec<ModalitySummary> = data
            .modalities
            .iter()
            .map(|m| {
                let active = matches!(data.tracker.lookup(m.id), Some((_, false)));
                m.summary(active)
            })
            .collect();
        Ok(MeasurementSummary {
            id: self.id,
            created_at: data.created_at,
            last_consumed_at: data.last_consumed_at,
            payloads: data.payloads,
            bytes: data.bytes,
            samples: modalities.iter().map(|m| m.samples).sum(),
            modalities,
        })
    }

    /// Free all storage and refuse further operations
    ///
    /// Waits for in-flight consumes and exports to finish.
    pub fn release(&self) {
        let mut data = self.data.acquire_exclusive();
        data.dropped = true;
        data.modalities = Vec::new();
        data.tracker = ModalityTracker::new();
    }
}
