//! Device-clock timestamp reconstruction
//!
//! Sensors do not timestamp samples. Every notification carries a rolling
//! counter instead, and the device samples at a fixed nominal rate, so the
//! device time of each sample can be recovered from the counter sequence:
//!
//! ```text
//! period        = rate_scaler / hz
//! delta         = counter - previous_counter   (mod 2^32)
//! missed        = delta - 1
//! start_tick    = previous_end_tick + missed * sample_count
//! t(sample k)   = (start_tick + k) * period
//! ```
//!
//! Missed notifications are assumed to have carried as many samples as the
//! notification that follows them. They are not back-filled, but the device
//! time they covered is skipped so later samples do not drift.
//!
//! Time is tracked in whole sample ticks and only converted to seconds at
//! the end, so long recordings accumulate no rounding error.

use crate::error::{Result, SensorError};

/// Counter deltas at or beyond half the counter range are treated as stale
const HALF_RANGE: u32 = 1 << 31;

/// One consumed notification, as needed to rebuild its timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalRecord {
    /// Rolling notification counter from the payload header
    pub notification_counter: u32,
    /// Samples per channel carried by the notification
    pub sample_count: u32,
    /// Index of the notification's first sample within its modality
    pub first_sample: u64,
}

/// How a counter relates to the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterStep {
    /// The next notification in sequence
    Consecutive,
    /// `missed` notifications were lost in between
    Gap { missed: u32 },
}

/// Classify `current` against `previous`, handling wrap-around
///
/// # Returns
/// The step, or [`SensorError::InvalidPayload`] for a repeated counter or one
/// that lies behind `previous` (more than half the counter range ahead).
pub fn classify(previous: u32, current: u32) -> Result<CounterStep> {
    // Calculate difference accounting for wrap-around
    let delta = current.wrapping_sub(previous);
    match delta {
        0 => Err(SensorError::invalid_payload(format!(
            "duplicate notification counter {}",
            current
        ))),
        1 => Ok(CounterStep::Consecutive),
        d if d < HALF_RANGE => Ok(CounterStep::Gap { missed: d - 1 }),
        _ => Err(SensorError::invalid_payload(format!(
            "out of order notification counter {} after {}",
            current, previous
        ))),
    }
}

/// Nominal sample period derived from export parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleClock {
    period: f64,
}

impl SampleClock {
    /// Create a clock sampling `hz` times per `rate_scaler` seconds
    ///
    /// # Arguments
    /// * `hz` - Nominal sampling rate in Hz (1 second period)
    /// * `rate_scaler` - Multiplier on the 1 second period
    pub fn new(hz: f32, rate_scaler: f32) -> Result<Self> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(SensorError::InvalidExportParameters(format!(
                "hz must be positive, got {}",
                hz
            )));
        }
        if !rate_scaler.is_finite() || rate_scaler <= 0.0 {
            return Err(SensorError::InvalidExportParameters(format!(
                "rate_scaler must be positive, got {}",
                rate_scaler
            )));
        }
        Ok(Self {
            period: f64::from(rate_scaler) / f64::from(hz),
        })
    }

    /// Seconds between consecutive samples
    pub fn period(&self) -> f64 {
        self.period
    }

    /// Device time of a sample tick
    pub fn seconds(&self, tick: u64) -> f64 {
        tick as f64 * self.period
    }
}

/// Sample tick at which each notification starts
///
/// The first notification starts at tick 0. Records are expected to have
/// passed [`classify`] at ingestion; a repeated or stale counter that slips
/// through is treated as consecutive rather than moving time backwards.
pub fn notification_ticks(records: &[ArrivalRecord]) -> Vec<u64> {
    let mut ticks = Vec::with_capacity(records.len());
    let mut cursor: u64 = 0;
    let mut previous: Option<u32> = None;

    for record in records {
        let samples = u64::from(record.sample_count);
        let missed = match previous.map(|p| classify(p, record.notification_counter)) {
            Some(Ok(CounterStep::Gap { missed })) => u64::from(missed),
            _ => 0,
        };
        let start = cursor.saturating_add(missed.saturating_mul(samples));
        ticks.push(start);
        cursor = start.saturating_add(samples);
        previous = Some(record.notification_counter);
    }

    ticks
}

/// Device-time timeline of one modality's samples
#[derive(Debug, Clone)]
pub struct Timeline<'a> {
    records: &'a [ArrivalRecord],
    ticks: Vec<u64>,
    clock: SampleClock,
}

impl<'a> Timeline<'a> {
    /// Rebuild the timeline of `records` under `clock`
    pub fn new(records: &'a [ArrivalRecord], clock: SampleClock) -> Self {
        Self {
            ticks: notification_ticks(records),
            records,
            clock,
        }
    }

    /// Total samples covered by the records
    pub fn sample_count(&self) -> u64 {
        self.records
            .last()
            .map(|r| r.first_sample + u64::from(r.sample_count))
            .unwrap_or(0)
    }

    /// Timestamp of the newest sample, if any
    pub fn last_timestamp(&self) -> Option<f64> {
        let (record, tick) = self.records.iter().zip(&self.ticks).last()?;
        let last = tick + u64::from(record.sample_count.checked_sub(1)?);
        Some(self.clock.seconds(last))
    }

    /// Index of the first sample whose timestamp is `>= cutoff`
    pub fn first_sample_at_or_after(&self, cutoff: f64) -> u64 {
        let period = self.clock.period();
        for (record, &tick) in self.records.iter().zip(&self.ticks) {
            let end_tick = tick + u64::from(record.sample_count);
            if end_tick > tick && self.clock.seconds(end_tick - 1) >= cutoff {
                let offset = ((cutoff / period) - tick as f64).ceil().max(0.0) as u64;
                let mut k = offset.min(u64::from(record.sample_count) - 1);
                // Step back over rounding at the boundary
                while k > 0 && self.clock.seconds(tick + k - 1) >= cutoff {
                    k -= 1;
                }
                while self.clock.seconds(tick + k) < cutoff {
                    k += 1;
                }
                return record.first_sample + k;
            }
        }
        self.sample_count()
    }

    /// Timestamps of samples `from..` in sample order
    pub fn timestamps_from(&self, from: u64) -> impl Iterator<Item = (u64, f64)> + '_ {
        let clock = self.clock;
        self.records
            .iter()
            .zip(self.ticks.iter())
            .filter(move |(r, _)| r.first_sample + u64::from(r.sample_count) > from)
            .flat_map(move |(r, &tick)| {
                let skip = from.saturating_sub(r.first_sample);
                (skip..u64::from(r.sample_count))
                    .map(move |k| (r.first_sample + k, clock.seconds(tick + k)))
            })
    }
}
