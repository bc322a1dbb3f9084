//! E2E tests for ingestion and export through the C interface
//!
//! Drives the `qs_*` functions the way a host app does: feed notification
//! payloads, export windows, read the buffers through the returned
//! pointers, and return them.

use approx::assert_relative_eq;
use qsib_sensor::*;
use qsib_sensor_core::signal::payload::encode;
use rand::{Rng, SeedableRng};

struct Consumed {
    modality_id: u64,
    modality_type: u8,
    channels: u8,
    samples: u32,
}

fn consume(measurement: u32, payload: &[u8]) -> Option<Consumed> {
    let mut out = Consumed {
        modality_id: 0,
        modality_type: 0,
        channels: 0,
        samples: 0,
    };
    let ok = unsafe {
        qs_measurement_consume(
            measurement,
            payload.as_ptr(),
            payload.len() as u16,
            &mut out.modality_id,
            &mut out.modality_type,
            &mut out.channels,
            &mut out.samples,
        )
    };
    ok.then_some(out)
}

/// Export copied out of the returned buffer
struct Exported {
    buffer_id: u32,
    timestamps: Vec<f64>,
    channels: Vec<Vec<f64>>,
}

#[allow(clippy::too_many_arguments)]
fn export(
    measurement: u32,
    modality: u64,
    hz: f32,
    rate_scaler: f32,
    seed: u64,
    threshold: i64,
    scale: u32,
    trailing_s: f32,
) -> Option<Exported> {
    let mut buffer_id = 0u32;
    let mut num_samples = 0u32;
    let mut num_channels = 0u8;
    let mut timestamps: *const f64 = std::ptr::null();
    let mut channels: *const *const f64 = std::ptr::null();

    let ok = unsafe {
        qs_measurement_export(
            measurement,
            modality,
            hz,
            rate_scaler,
            seed,
            threshold,
            scale,
            trailing_s,
            &mut buffer_id,
            &mut num_samples,
            &mut num_channels,
            &mut timestamps,
            &mut channels,
        )
    };
    if !ok {
        return None;
    }

    let n = num_samples as usize;
    unsafe {
        let table = std::slice::from_raw_parts(channels, num_channels as usize);
        Some(Exported {
            buffer_id,
            timestamps: std::slice::from_raw_parts(timestamps, n).to_vec(),
            channels: table
                .iter()
                .map(|&ptr| std::slice::from_raw_parts(ptr, n).to_vec())
                .collect(),
        })
    }
}

fn export_all(measurement: u32, modality: u64, hz: f32) -> Option<Exported> {
    export(measurement, modality, hz, 1.0, 0, -1, 0, 0.0)
}

/// Test the three-notification scenario end to end
#[test]
fn test_three_notifications_export_all() {
    qs_init();
    let id = qs_measurement_create();
    assert_ne!(id, 0, "Measurement id must be nonzero");

    let mut modality = 0;
    for counter in 1..=3u32 {
        let samples: Vec<i32> = (0..10).map(|i| (counter as i32 - 1) * 10 + i).collect();
        let out = consume(id, &encode(2, 2, counter, 1, &samples)).expect("consume failed");
        assert_eq!(out.modality_type, 2);
        assert_eq!(out.channels, 1);
        assert_eq!(out.samples, 10);
        modality = out.modality_id;
    }

    let exported = export_all(id, modality, 100.0).expect("export failed");
    assert_eq!(exported.timestamps.len(), 30);
    assert_eq!(exported.channels.len(), 1);
    assert_eq!(exported.channels[0], (0..30).map(f64::from).collect::<Vec<_>>());
    assert_relative_eq!(
        exported.timestamps[29] - exported.timestamps[0],
        29.0 * 0.01,
        epsilon = 1e-12
    );
    for pair in exported.timestamps.windows(2) {
        assert!(pair[1] > pair[0], "Timestamps must strictly increase");
    }

    assert!(qs_buffer_return(exported.buffer_id));
    assert!(qs_measurement_drop(id));
}

/// Test that rate_scaler stretches the sample period
#[test]
fn test_rate_scaler_period() {
    let id = qs_measurement_create();
    let out = consume(id, &encode(0, 2, 0, 1, &[1, 2, 3, 4, 5])).unwrap();

    let exported = export(id, out.modality_id, 50.0, 2.0, 0, -1, 0, 0.0).unwrap();
    assert_relative_eq!(exported.timestamps[1] - exported.timestamps[0], 0.04, epsilon = 1e-12);

    assert!(qs_buffer_return(exported.buffer_id));
    assert!(qs_measurement_drop(id));
}

/// Test that a channel change on the same wire type starts a new modality
#[test]
fn test_channel_change_rolls_over() {
    let id = qs_measurement_create();
    let first = consume(id, &encode(5, 2, 1, 1, &[1, 2, 3])).unwrap();
    let second = consume(id, &encode(5, 2, 2, 2, &[4, 5, 6, 7])).unwrap();
    assert_ne!(first.modality_id, second.modality_id);

    // The rolled-over modality keeps its data
    let old = export_all(id, first.modality_id, 10.0).unwrap();
    assert_eq!(old.channels, vec![vec![1.0, 2.0, 3.0]]);
    let new = export_all(id, second.modality_id, 10.0).unwrap();
    assert_eq!(new.channels, vec![vec![4.0, 6.0], vec![5.0, 7.0]]);

    assert!(qs_buffer_return(old.buffer_id));
    assert!(qs_buffer_return(new.buffer_id));
    assert!(qs_measurement_drop(id));
}

/// Test retiring a modality and reusing its wire type
#[test]
fn test_retire_then_reuse_wire_type() {
    let id = qs_measurement_create();
    let first = consume(id, &encode(3, 1, 10, 1, &[7, 8])).unwrap();
    assert!(qs_modality_retire(id, first.modality_id));
    assert!(
        !qs_modality_retire(id, first.modality_id),
        "Second retire must fail"
    );

    let second = consume(id, &encode(3, 1, 11, 1, &[9])).unwrap();
    assert_ne!(second.modality_id, first.modality_id);

    let old = export_all(id, first.modality_id, 1.0).unwrap();
    assert_eq!(old.channels[0], vec![7.0, 8.0]);
    assert!(qs_buffer_return(old.buffer_id));
    assert!(qs_measurement_drop(id));
}

/// Test buffer return semantics
#[test]
fn test_return_buffer_twice() {
    let id = qs_measurement_create();
    let out = consume(id, &encode(1, 2, 0, 1, &[1, 2])).unwrap();
    let exported = export_all(id, out.modality_id, 10.0).unwrap();

    assert!(qs_buffer_return(exported.buffer_id));
    assert!(
        !qs_buffer_return(exported.buffer_id),
        "Second return must fail"
    );
    assert!(qs_measurement_drop(id));
}

/// Test that dropped measurements reject further use
#[test]
fn test_dropped_measurement() {
    let id = qs_measurement_create();
    let out = consume(id, &encode(0, 2, 0, 1, &[1])).unwrap();
    assert!(qs_measurement_drop(id));

    assert!(consume(id, &encode(0, 2, 1, 1, &[2])).is_none());
    assert!(export_all(id, out.modality_id, 10.0).is_none());
    assert!(!qs_measurement_drop(id), "Second drop must fail");
}

/// Test deterministic downsampling of a trailing window
#[test]
fn test_downsampled_window_is_reproducible() {
    let id = qs_measurement_create();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut modality = 0;
    for counter in 0..40u32 {
        let samples: Vec<i32> = (0..24).map(|_| rng.gen_range(-2000..2000)).collect();
        modality = consume(id, &encode(4, 2, counter, 3, &samples))
            .unwrap()
            .modality_id;
    }

    // 320 samples at 32 Hz, newest 5 seconds, roughly a quarter kept
    let a = export(id, modality, 32.0, 1.0, 0xC0FFEE, 255, 1024, 5.0).unwrap();
    let b = export(id, modality, 32.0, 1.0, 0xC0FFEE, 255, 1024, 5.0).unwrap();
    assert_eq!(a.timestamps, b.timestamps);
    assert_eq!(a.channels, b.channels);
    assert!(!a.timestamps.is_empty());
    assert!(a.timestamps.len() < 161, "Downsampling should drop samples");

    let last = 319.0 / 32.0;
    assert!(a.timestamps.iter().all(|&t| t >= last - 5.0 && t <= last));

    // threshold = scale - 1 keeps the whole window
    let full = export(id, modality, 32.0, 1.0, 0xC0FFEE, 1023, 1024, 5.0).unwrap();
    assert_eq!(full.timestamps.len(), 161);
    for t in &a.timestamps {
        assert!(full.timestamps.contains(t), "Kept sample must be in the window");
    }

    for buffer in [a.buffer_id, b.buffer_id, full.buffer_id] {
        assert!(qs_buffer_return(buffer));
    }
    assert!(qs_measurement_drop(id));
}

/// Test that a counter gap shifts later timestamps by the missing time
#[test]
fn test_counter_gap_keeps_device_time() {
    let id = qs_measurement_create();
    consume(id, &encode(6, 2, 100, 1, &[0; 5])).unwrap();
    // Counters 101 and 102 lost
    let out = consume(id, &encode(6, 2, 103, 1, &[1; 5])).unwrap();

    let exported = export_all(id, out.modality_id, 10.0).unwrap();
    assert_eq!(exported.timestamps.len(), 10);
    assert_relative_eq!(exported.timestamps[4], 0.4, epsilon = 1e-12);
    assert_relative_eq!(exported.timestamps[5], 1.5, epsilon = 1e-12);

    assert!(qs_buffer_return(exported.buffer_id));
    assert!(qs_measurement_drop(id));
}

/// Test counter wraparound stays contiguous
#[test]
fn test_counter_wraparound() {
    let id = qs_measurement_create();
    let mut modality = 0;
    for counter in [u32::MAX - 1, u32::MAX, 0, 1] {
        modality = consume(id, &encode(9, 1, counter, 1, &[1, 2])).unwrap().modality_id;
    }

    let exported = export_all(id, modality, 2.0).unwrap();
    assert_eq!(exported.timestamps.len(), 8);
    assert_relative_eq!(exported.timestamps[7], 3.5, epsilon = 1e-12);

    assert!(qs_buffer_return(exported.buffer_id));
    assert!(qs_measurement_drop(id));
}

/// Test the JSON summary
#[test]
fn test_summary_json() {
    let id = qs_measurement_create();
    consume(id, &encode(2, 2, 1, 1, &[1, 2, 3])).unwrap();
    consume(id, &encode(2, 2, 3, 1, &[4, 5, 6])).unwrap();

    let ptr = qs_measurement_summary(id);
    assert!(!ptr.is_null());
    let json: serde_json::Value = unsafe {
        let text = std::ffi::CStr::from_ptr(ptr).to_str().unwrap();
        serde_json::from_str(text).unwrap()
    };
    unsafe { qs_summary_drop(ptr) };

    assert_eq!(json["id"], id);
    assert_eq!(json["payloads"], 2);
    assert_eq!(json["samples"], 6);
    assert_eq!(json["modalities"][0]["missed_notifications"], 1);
    assert!(json["created_at"].is_string());

    assert!(qs_measurement_drop(id));
    assert!(qs_measurement_summary(id).is_null());
}

/// Test the version string
#[test]
fn test_version_string() {
    let ptr = qs_version_get();
    assert!(!ptr.is_null());
    let text = unsafe { std::ffi::CStr::from_ptr(ptr) }
        .to_str()
        .unwrap()
        .to_string();
    unsafe { qs_version_drop(ptr) };

    assert!(
        text.starts_with(&format!("qsib-sensor {}", VERSION)),
        "Unexpected version string: {}",
        text
    );
}
