//! QSIB Sensor - C ABI over the ingestion and export engine
//!
//! This library exposes `qsib-sensor-core` to host applications (mobile apps
//! receiving BLE notifications) as a set of `qs_*` functions. The engine is a
//! process-wide instance created on first use, so every entry point is safe
//! to call before [`qs_init`].
//!
//! Failures never unwind into the host. They collapse into a sentinel (`0`,
//! `false`, or null) and leave a message that [`qs_errors_pop`] returns.
//!
//! See `include/qsib_sensor.h` for the C declarations.

pub mod strings;

use std::ffi::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;

pub use qsib_sensor_core::{
    ConsumeOutcome, EngineConfig, ExportParams, MeasurementSummary, SensorEngine, SensorError,
    VERSION,
};

use strings::{OwnedStrings, StringKind};

static ENGINE: OnceLock<SensorEngine> = OnceLock::new();
static STRINGS: OnceLock<OwnedStrings> = OnceLock::new();

/// The process-wide engine
pub fn engine() -> &'static SensorEngine {
    ENGINE.get_or_init(SensorEngine::from_env)
}

fn strings() -> &'static OwnedStrings {
    STRINGS.get_or_init(OwnedStrings::new)
}

/// Run `f`, turning a panic into `fallback` plus a diagnostic
fn guarded<T>(operation: &'static str, fallback: T, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!(operation, "Caught panic at C boundary");
            engine()
                .errors()
                .push(format!("Internal error in {}", operation));
            fallback
        }
    }
}

/// Fail `operation` with [`SensorError::NullPointer`] if any pointer is null
fn require_non_null(operation: &'static str, pointers: &[(&'static str, bool)]) -> bool {
    match pointers.iter().find(|(_, is_null)| *is_null) {
        Some(&(name, _)) => {
            engine().report(operation, SensorError::NullPointer(name));
            false
        }
        None => true,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("qsib_sensor=info".parse()?)
        .add_directive("qsib_sensor_core=info".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

/// Initialize logging and the engine
///
/// Idempotent and thread-safe. Logging is only installed if the host process
/// has no global tracing subscriber yet.
#[no_mangle]
pub extern "C" fn qs_init() {
    guarded("qs_init", (), || {
        if let Err(e) = init_tracing() {
            tracing::debug!(error = %e, "Tracing subscriber not installed");
        }
        let config = engine().config();
        tracing::info!(
            version = VERSION,
            max_payload_len = config.max_payload_len,
            max_measurements = config.max_measurements,
            "QSIB sensor library initialized"
        );
    })
}

/// Library version string; release with [`qs_version_drop`]
#[no_mangle]
pub extern "C" fn qs_version_get() -> *const c_char {
    guarded("qs_version_get", std::ptr::null(), || {
        strings().issue(StringKind::Version, qsib_sensor_core::version_string())
    })
}

/// Release a string returned by [`qs_version_get`]
///
/// # Safety
/// `ptr` must be null or a pointer returned by [`qs_version_get`]. Pointers
/// that are not outstanding are reported and left alone.
#[no_mangle]
pub unsafe extern "C" fn qs_version_drop(ptr: *const c_char) {
    release(StringKind::Version, ptr)
}

/// Oldest pending error message, or null when none is pending; release with
/// [`qs_errors_drop`]
#[no_mangle]
pub extern "C" fn qs_errors_pop() -> *const c_char {
    guarded("qs_errors_pop", std::ptr::null(), || {
        match engine().pop_error() {
            Some(message) => strings().issue(StringKind::Error, message),
            None => std::ptr::null(),
        }
    })
}

/// Release a string returned by [`qs_errors_pop`]
///
/// # Safety
/// `ptr` must be null or a pointer returned by [`qs_errors_pop`]. Pointers
/// that are not outstanding are reported and left alone.
#[no_mangle]
pub unsafe extern "C" fn qs_errors_drop(ptr: *const c_char) {
    release(StringKind::Error, ptr)
}

/// Create a measurement
///
/// # Returns
/// Its id, or 0 on allocation failure or when the optional
/// `max_measurements` cap from the config file is reached
#[no_mangle]
pub extern "C" fn qs_measurement_create() -> u32 {
    guarded("qs_measurement_create", 0, || {
        engine().create_measurement().unwrap_or(0)
    })
}

/// Drop a measurement and free its storage
///
/// Export buffers already checked out from it stay valid until returned.
#[no_mangle]
pub extern "C" fn qs_measurement_drop(measurement_id: u32) -> bool {
    guarded("qs_measurement_drop", false, || {
        engine().drop_measurement(measurement_id).is_ok()
    })
}

/// Ingest one notification payload
///
/// # Arguments
/// * `buf`, `len` - Raw notification bytes
/// * `modality_id` - Receives the durable modality id
/// * `modality_type` - Receives the on-wire modality type
/// * `num_channels` - Receives the channel count
/// * `num_samples` - Receives the samples per channel consumed
///
/// # Safety
/// `buf` must point to `len` readable bytes and every output pointer must be
/// valid for a write. Null pointers fail the call.
#[no_mangle]
pub unsafe extern "C" fn qs_measurement_consume(
    measurement_id: u32,
    buf: *const u8,
    len: u16,
    modality_id: *mut u64,
    modality_type: *mut u8,
    num_channels: *mut u8,
    num_samples: *mut u32,
) -> bool {
    guarded("qs_measurement_consume", false, || {
        if !require_non_null(
            "consume",
            &[
                ("buf", buf.is_null()),
                ("modality_id", modality_id.is_null()),
                ("modality_type", modality_type.is_null()),
                ("num_channels", num_channels.is_null()),
                ("num_samples", num_samples.is_null()),
            ],
        ) {
            return false;
        }

        // SAFETY: caller guarantees `len` readable bytes at non-null `buf`
        let payload = unsafe { std::slice::from_raw_parts(buf, usize::from(len)) };
        match engine().consume(measurement_id, payload) {
            Ok(outcome) => {
                // SAFETY: outputs checked non-null; caller guarantees validity
                unsafe {
                    *modality_id = outcome.modality_id;
                    *modality_type = outcome.modality_type;
                    *num_channels = outcome.channels;
                    *num_samples = outcome.sample_count;
                }
                true
            }
            Err(_) => false,
        }
    })
}

/// Export a window of a modality into a checked-out buffer
///
/// On success the outputs describe a buffer that stays readable until
/// [`qs_buffer_return`] is called with `*buffer_id`:
/// `*timestamp_data` points to `*num_samples` timestamps in seconds and
/// `*channel_data` to `*num_channels` pointers of `*num_samples` values each.
///
/// # Arguments
/// * `hz`, `rate_scaler` - Sample period is `rate_scaler / hz` seconds
/// * `downsample_seed`, `downsample_threshold`, `downsample_scale` - Keep
///   sample `i` when `draw(seed, i) % scale <= threshold`; a negative
///   threshold or zero scale keeps everything
/// * `trailing_s` - Keep only the newest `trailing_s` seconds; zero or
///   negative keeps everything
///
/// # Safety
/// Every output pointer must be valid for a write. Null pointers fail the
/// call.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn qs_measurement_export(
    measurement_id: u32,
    modality_id: u64,
    hz: f32,
    rate_scaler: f32,
    downsample_seed: u64,
    downsample_threshold: i64,
    downsample_scale: u32,
    trailing_s: f32,
    buffer_id: *mut u32,
    num_samples: *mut u32,
    num_channels: *mut u8,
    timestamp_data: *mut *const f64,
    channel_data: *mut *const *const f64,
) -> bool {
    guarded("qs_measurement_export", false, || {
        if !require_non_null(
            "export",
            &[
                ("buffer_id", buffer_id.is_null()),
                ("num_samples", num_samples.is_null()),
                ("num_channels", num_channels.is_null()),
                ("timestamp_data", timestamp_data.is_null()),
                ("channel_data", channel_data.is_null()),
            ],
        ) {
            return false;
        }

        let params = ExportParams {
            hz,
            rate_scaler,
            downsample_seed,
            downsample_threshold,
            downsample_scale: u64::from(downsample_scale),
            trailing_s,
        };
        let engine = engine();
        let lease = match engine.export(measurement_id, modality_id, &params) {
            Ok(lease) => lease,
            Err(_) => return false,
        };

        let (Ok(samples), Ok(channels)) = (
            u32::try_from(lease.num_samples()),
            u8::try_from(lease.num_channels()),
        ) else {
            let samples = lease.num_samples();
            let _ = engine.return_lease(lease);
            engine.report(
                "export",
                SensorError::AllocationFailure(format!(
                    "{} samples exceed the C interface limit",
                    samples
                )),
            );
            return false;
        };

        // SAFETY: outputs checked non-null; caller guarantees validity
        unsafe {
            *buffer_id = lease.buffer_id();
            *num_samples = samples;
            *num_channels = channels;
            *timestamp_data = lease.timestamp_ptr();
            *channel_data = lease.channel_ptrs();
        }
        // The pool keeps the buffer alive until it is returned by id
        drop(lease);
        true
    })
}

/// Return an export buffer
///
/// # Returns
/// `false` if the buffer is not checked out, including a second return
#[no_mangle]
pub extern "C" fn qs_buffer_return(buffer_id: u32) -> bool {
    guarded("qs_buffer_return", false, || {
        engine().return_buffer(buffer_id).is_ok()
    })
}

/// Retire an active modality; the next payload of its wire type starts a new
/// modality
#[no_mangle]
pub extern "C" fn qs_modality_retire(measurement_id: u32, modality_id: u64) -> bool {
    guarded("qs_modality_retire", false, || {
        engine().retire_modality(measurement_id, modality_id).is_ok()
    })
}

/// JSON summary of a measurement, or null on failure; release with
/// [`qs_summary_drop`]
#[no_mangle]
pub extern "C" fn qs_measurement_summary(measurement_id: u32) -> *const c_char {
    guarded("qs_measurement_summary", std::ptr::null(), || {
        let engine = engine();
        let Ok(summary) = engine.summary(measurement_id) else {
            return std::ptr::null();
        };
        match serde_json::to_string(&summary) {
            Ok(json) => strings().issue(StringKind::Summary, json),
            Err(e) => {
                tracing::error!(
                    measurement = measurement_id,
                    error = %e,
                    "Failed to serialize summary"
                );
                engine
                    .errors()
                    .push(format!("Failed to serialize summary: {}", e));
                std::ptr::null()
            }
        }
    })
}

/// Release a string returned by [`qs_measurement_summary`]
///
/// # Safety
/// `ptr` must be null or a pointer returned by [`qs_measurement_summary`].
/// Pointers that are not outstanding are reported and left alone.
#[no_mangle]
pub unsafe extern "C" fn qs_summary_drop(ptr: *const c_char) {
    release(StringKind::Summary, ptr)
}

/// Release an issued string; null is ignored
fn release(kind: StringKind, ptr: *const c_char) {
    if ptr.is_null() {
        return;
    }
    guarded("release", (), || {
        if let Err(message) = strings().release(kind, ptr) {
            tracing::error!(reason = %message, "Refused to release string");
            engine().errors().push(message);
        }
    })
}
