//! E2E tests for failure reporting through the C interface
//!
//! Every failure must return a sentinel and leave a message on the error
//! queue. The queue is process-wide, so these tests run one at a time.

use parking_lot::Mutex;
use qsib_sensor::*;
use qsib_sensor_core::signal::payload::encode;
use std::ffi::{c_char, CStr};

static SERIAL: Mutex<()> = Mutex::new(());

fn drain() -> Vec<String> {
    let mut messages = Vec::new();
    loop {
        let ptr = qs_errors_pop();
        if ptr.is_null() {
            return messages;
        }
        messages.push(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned());
        unsafe { qs_errors_drop(ptr) };
    }
}

fn consume(measurement: u32, payload: &[u8]) -> bool {
    let (mut modality, mut kind, mut channels, mut samples) = (0u64, 0u8, 0u8, 0u32);
    unsafe {
        qs_measurement_consume(
            measurement,
            payload.as_ptr(),
            payload.len() as u16,
            &mut modality,
            &mut kind,
            &mut channels,
            &mut samples,
        )
    }
}

/// Test that malformed payloads are rejected with a message
#[test]
fn test_malformed_payloads() {
    let _serial = SERIAL.lock();
    qs_init();
    drain();

    let id = qs_measurement_create();
    assert!(!consume(id, &[0x08, 0x00, 0x01]), "Truncated header must fail");

    // Declared length longer than the buffer
    let mut payload = encode(1, 2, 0, 1, &[1, 2]);
    payload[0] = 0xFF;
    assert!(!consume(id, &payload));

    // Zero channels
    let mut payload = encode(1, 2, 0, 1, &[1, 2]);
    payload[2] = 0;
    assert!(!consume(id, &payload));

    // Width 0
    let mut payload = encode(1, 2, 0, 1, &[1, 2]);
    payload[3] = 0x01;
    assert!(!consume(id, &payload));

    let messages = drain();
    assert_eq!(messages.len(), 4, "One message per failure: {:?}", messages);
    assert!(messages.iter().all(|m| m.starts_with("Invalid payload")));

    // The measurement is still usable
    assert!(consume(id, &encode(1, 2, 0, 1, &[1, 2])));
    assert!(qs_measurement_drop(id));
    assert!(drain().is_empty());
}

/// Test duplicate and stale counters
#[test]
fn test_counter_rejections() {
    let _serial = SERIAL.lock();
    drain();

    let id = qs_measurement_create();
    assert!(consume(id, &encode(0, 2, 50, 1, &[1])));
    assert!(!consume(id, &encode(0, 2, 50, 1, &[2])), "Duplicate counter");
    assert!(!consume(id, &encode(0, 2, 49, 1, &[2])), "Stale counter");
    assert!(consume(id, &encode(0, 2, 51, 1, &[2])));

    assert_eq!(drain().len(), 2);
    assert!(qs_measurement_drop(id));
}

/// Test null pointer handling
#[test]
fn test_null_pointers() {
    let _serial = SERIAL.lock();
    drain();

    let id = qs_measurement_create();
    let payload = encode(0, 2, 0, 1, &[1]);
    let (mut kind, mut channels, mut samples) = (0u8, 0u8, 0u32);
    let ok = unsafe {
        qs_measurement_consume(
            id,
            payload.as_ptr(),
            payload.len() as u16,
            std::ptr::null_mut(),
            &mut kind,
            &mut channels,
            &mut samples,
        )
    };
    assert!(!ok);

    let ok = unsafe {
        qs_measurement_consume(
            id,
            std::ptr::null(),
            8,
            std::ptr::null_mut(),
            &mut kind,
            &mut channels,
            &mut samples,
        )
    };
    assert!(!ok);

    let ok = unsafe {
        qs_measurement_export(
            id,
            1,
            10.0,
            1.0,
            0,
            -1,
            0,
            0.0,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    assert!(!ok);

    let messages = drain();
    assert_eq!(
        messages,
        vec![
            "Null pointer passed for modality_id".to_string(),
            "Null pointer passed for buf".to_string(),
            "Null pointer passed for buffer_id".to_string(),
        ]
    );

    // Nothing was consumed by the rejected calls
    assert!(consume(id, &payload));
    assert!(qs_measurement_drop(id));
}

/// Test invalid export parameters
#[test]
fn test_invalid_export_parameters() {
    let _serial = SERIAL.lock();
    drain();

    let id = qs_measurement_create();
    assert!(consume(id, &encode(0, 2, 0, 1, &[1, 2, 3])));

    let mut buffer_id = 0u32;
    let mut num_samples = 0u32;
    let mut num_channels = 0u8;
    let mut timestamps: *const f64 = std::ptr::null();
    let mut channels: *const *const f64 = std::ptr::null();
    for (hz, rate_scaler) in [(0.0f32, 1.0f32), (-1.0, 1.0), (f32::NAN, 1.0), (10.0, 0.0)] {
        let ok = unsafe {
            qs_measurement_export(
                id,
                1,
                hz,
                rate_scaler,
                0,
                -1,
                0,
                0.0,
                &mut buffer_id,
                &mut num_samples,
                &mut num_channels,
                &mut timestamps,
                &mut channels,
            )
        };
        assert!(!ok, "hz={} rate_scaler={} must be rejected", hz, rate_scaler);
    }

    let messages = drain();
    assert_eq!(messages.len(), 4);
    assert!(messages
        .iter()
        .all(|m| m.starts_with("Invalid export parameters")));
    assert!(qs_measurement_drop(id));
}

/// Test that string release refuses pointers it does not own
#[test]
fn test_bad_string_release() {
    let _serial = SERIAL.lock();
    drain();

    let version = qs_version_get();
    unsafe { qs_version_drop(version) };
    // Double release is refused, not freed again
    unsafe { qs_version_drop(version) };

    let foreign = b"foreign\0";
    unsafe { qs_summary_drop(foreign.as_ptr() as *const c_char) };
    // Null is ignored
    unsafe { qs_errors_drop(std::ptr::null()) };

    let messages = drain();
    assert_eq!(messages.len(), 2, "Unexpected messages: {:?}", messages);
    assert!(messages[0].contains("qs_version_drop"));
    assert!(messages[1].contains("qs_summary_drop"));
}

/// Test that the queue keeps only the newest messages
#[test]
fn test_error_queue_overflow() {
    let _serial = SERIAL.lock();
    drain();

    for buffer_id in 1_000_001..=1_000_020u32 {
        assert!(!qs_buffer_return(buffer_id));
    }

    let messages = drain();
    assert_eq!(messages.len(), 16);
    assert_eq!(messages[0], "Buffer 1000005 is not checked out");
    assert_eq!(messages[15], "Buffer 1000020 is not checked out");
}

/// Test unknown ids
#[test]
fn test_unknown_ids() {
    let _serial = SERIAL.lock();
    drain();

    assert!(!qs_measurement_drop(0));
    assert!(!qs_modality_retire(0, 1));
    assert!(qs_measurement_summary(0).is_null());

    let id = qs_measurement_create();
    assert!(!qs_modality_retire(id, 1));
    assert!(qs_measurement_drop(id));

    let messages = drain();
    assert_eq!(
        messages,
        vec![
            "Unknown measurement: 0".to_string(),
            "Unknown measurement: 0".to_string(),
            "Unknown measurement: 0".to_string(),
            format!("Unknown modality 1 in measurement {}", id),
        ]
    );
}
