//! Notification payload decoding
//!
//! ## Wire Format
//!
//! All multi-byte fields are little-endian:
//!
//! ```text
//! offset size field
//! 0      2    declared payload length, header included
//! 2      1    channel count (>= 1)
//! 3      1    high nibble: bytes per value (1..=4), low nibble: modality type
//! 4      4    rolling notification counter
//! 8      ..   sample_count x channel_count signed values, sample-major
//! ```
//!
//! The sample count is implied by the body length. Bytes past the declared
//! length are ignored.

use crate::error::{Result, SensorError};

/// Size of the fixed header in bytes
pub const HEADER_LEN: usize = 8;

/// Highest modality type representable in the header nibble
pub const MAX_MODALITY_TYPE: u8 = 0x0F;

/// Parsed notification header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// On-wire modality type (0..=15)
    pub modality_type: u8,
    /// Interleaved channels per sample
    pub channels: u8,
    /// Bytes per channel value (1..=4)
    pub sample_width: u8,
    /// Rolling notification counter
    pub notification_counter: u32,
    /// Samples per channel carried by this notification
    pub sample_count: u32,
}

/// A decoded notification: header plus sample-major values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub header: Header,
    /// `sample_count * channels` values, `samples[s * channels + c]`
    pub samples: Vec<i32>,
}

impl Notification {
    /// Values of one channel in sample order
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = i32> + '_ {
        let stride = usize::from(self.header.channels);
        self.samples.iter().skip(channel).step_by(stride).copied()
    }
}

/// Decode a notification payload
///
/// # Arguments
/// * `bytes` - Raw payload as delivered by the transport
/// * `max_len` - Largest declared length accepted
///
/// # Returns
/// The decoded notification, or [`SensorError::InvalidPayload`] describing
/// the first inconsistency found. Nothing is indexed before its bounds have
/// been validated.
pub fn decode(bytes: &[u8], max_len: usize) -> Result<Notification> {
    if bytes.len() < HEADER_LEN {
        return Err(SensorError::invalid_payload(format!(
            "truncated header: {} bytes, need {}",
            bytes.len(),
            HEADER_LEN
        )));
    }

    let declared = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    if declared < HEADER_LEN {
        return Err(SensorError::invalid_payload(format!(
            "declared length {} shorter than header",
            declared
        )));
    }
    if declared > bytes.len() {
        return Err(SensorError::invalid_payload(format!(
            "declared length {} exceeds buffer of {} bytes",
            declared,
            bytes.len()
        )));
    }
    if declared > max_len {
        return Err(SensorError::invalid_payload(format!(
            "declared length {} exceeds maximum {}",
            declared, max_len
        )));
    }

    let channels = bytes[2];
    let sample_width = bytes[3] >> 4;
    let modality_type = bytes[3] & MAX_MODALITY_TYPE;
    let notification_counter = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    if channels == 0 {
        return Err(SensorError::invalid_payload("zero channels"));
    }
    if !(1..=4).contains(&sample_width) {
        return Err(SensorError::invalid_payload(format!(
            "unsupported sample width {}",
            sample_width
        )));
    }

    let body = &bytes[HEADER_LEN..declared];
    let frame_len = usize::from(channels)
        .checked_mul(usize::from(sample_width))
        .ok_or_else(|| SensorError::invalid_payload("frame size overflow"))?;
    if body.is_empty() {
        return Err(SensorError::invalid_payload("no samples"));
    }
    if body.len() % frame_len != 0 {
        return Err(SensorError::invalid_payload(format!(
            "body of {} bytes is not a multiple of {} channels x {} bytes",
            body.len(),
            channels,
            sample_width
        )));
    }

    let sample_count = u32::try_from(body.len() / frame_len)
        .map_err(|_| SensorError::invalid_payload("sample count overflow"))?;

    let width = usize::from(sample_width);
    let samples = body
        .chunks_exact(width)
        .map(|value| sign_extend(value))
        .collect();

    Ok(Notification {
        header: Header {
            modality_type,
            channels,
            sample_width,
            notification_counter,
            sample_count,
        },
        samples,
    })
}

/// Encode a notification in wire format
///
/// Used by tests and tooling to produce payloads; values are truncated to
/// `sample_width` bytes.
pub fn encode(
    modality_type: u8,
    sample_width: u8,
    notification_counter: u32,
    channels: u8,
    samples: &[i32],
) -> Vec<u8> {
    let width = usize::from(sample_width);
    let total = HEADER_LEN + samples.len() * width;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u16).to_le_bytes());
    out.push(channels);
    out.push((sample_width << 4) | (modality_type & MAX_MODALITY_TYPE));
    out.extend_from_slice(&notification_counter.to_le_bytes());
    for value in samples {
        out.extend_from_slice(&value.to_le_bytes()[..width]);
    }
    out
}

/// Interpret 1-4 little-endian bytes as a signed integer
fn sign_extend(value: &[u8]) -> i32 {
    let mut raw = [0u8; 4];
    raw[..value.len()].copy_from_slice(value);
    let shift = 32 - 8 * value.len() as u32;
    (i32::from_le_bytes(raw) << shift) >> shift
}
