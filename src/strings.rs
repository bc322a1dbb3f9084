//! Strings handed across the C boundary
//!
//! Every string returned to the host is a leaked `CString` whose address is
//! recorded here together with the function family that issued it. Release
//! only frees addresses that are outstanding for that family, so a double
//! release or a foreign pointer is reported instead of corrupting the heap.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{c_char, CString};

/// Function family a string was issued by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringKind {
    Version,
    Error,
    Summary,
}

impl StringKind {
    fn release_fn(self) -> &'static str {
        match self {
            StringKind::Version => "qs_version_drop",
            StringKind::Error => "qs_errors_drop",
            StringKind::Summary => "qs_summary_drop",
        }
    }
}

/// Registry of strings currently owned by the host
#[derive(Debug, Default)]
pub struct OwnedStrings {
    outstanding: Mutex<HashMap<usize, StringKind>>,
}

impl OwnedStrings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `text` to the host as a nul-terminated string
    ///
    /// Interior nul bytes are removed. Returns null only if the registry
    /// cannot grow.
    pub fn issue(&self, kind: StringKind, text: String) -> *const c_char {
        let text = if text.contains('\0') {
            text.replace('\0', "")
        } else {
            text
        };
        let Ok(owned) = CString::new(text) else {
            return std::ptr::null();
        };

        let mut outstanding = self.outstanding.lock();
        if outstanding.try_reserve(1).is_err() {
            return std::ptr::null();
        }
        let ptr = owned.into_raw();
        outstanding.insert(ptr as usize, kind);
        ptr
    }

    /// Free a string previously returned by [`Self::issue`]
    ///
    /// # Returns
    /// `Err` with a description when `ptr` is not outstanding for `kind`;
    /// nothing is freed in that case.
    pub fn release(&self, kind: StringKind, ptr: *const c_char) -> Result<(), String> {
        let address = ptr as usize;
        {
            let mut outstanding = self.outstanding.lock();
            match outstanding.get(&address) {
                Some(&issued) if issued == kind => {
                    outstanding.remove(&address);
                }
                Some(&issued) => {
                    return Err(format!(
                        "{} called with a string issued for {}",
                        kind.release_fn(),
                        issued.release_fn()
                    ));
                }
                None => {
                    return Err(format!(
                        "{} called with a pointer that is not outstanding ({:#x})",
                        kind.release_fn(),
                        address
                    ));
                }
            }
        }

        // SAFETY: the address came from `CString::into_raw` in `issue` and was
        // just removed from the registry, so it is freed exactly once.
        drop(unsafe { CString::from_raw(ptr as *mut c_char) });
        Ok(())
    }

    /// Number of strings the host has not released yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }
}
