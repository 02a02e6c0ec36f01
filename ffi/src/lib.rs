//! This library is the C interface to the converter. The hosting frontend loads the
//! emulation core and the plugins, then hands control over to a session created here;
//! everything the session needs from the core travels through function pointers in
//! `KrecRustSessionConfig`.
//!
//! This library auto-generates C headers on build (`includes/KrecRustExtensions.h`).

use std::ffi::{CStr, CString, c_char};
use std::path::PathBuf;

use mupen_integrations::Log;

pub mod encoders;
pub mod host;
pub mod logger;
pub mod session;

/// A small helper method for borrowing one of our known types back out of a pointer
/// handed to the host.
///
/// > This method operates in `unsafe` territory as it's operating on pointers owned by the
/// > host side. We control the host side and can verify the few places where these pointers
/// > are passed over. Instances are only ever borrowed shared here; anything that mutates
/// > goes through interior mutability, since the host may call in from more than one thread
/// > (e.g, cancelling from a UI thread while the emulation thread runs).
pub(crate) fn with_returning<T, F, R>(instance_ptr: usize, handler: F) -> R
where
    F: FnOnce(&T) -> R,
{
    // The host only passes pointers it received from a `*_create` call, and never after
    // the matching `*_destroy`.
    let instance = unsafe { &*(instance_ptr as *const T) };

    handler(instance)
}

/// A helper function for converting c str types to Rust ones with
/// some optional args for aiding in debugging should this ever be a problem.
///
/// This will panic if the strings being passed over cannot be converted. This is intentional, as
/// the host would be in an invalid state if this was not working.
pub(crate) fn c_str_to_string(string: *const c_char, fn_label: &str, err_label: &str) -> String {
    // This is theoretically safe as we control the strings being passed from
    // the host side, and can mostly guarantee that we know what we're getting.
    let slice = unsafe { CStr::from_ptr(string) };

    match slice.to_str() {
        Ok(s) => s.to_string(),

        Err(e) => {
            tracing::error!(
                target: Log::Core,
                error = ?e,
                "[{}] Failed to bridge {}, will panic",
                fn_label,
                err_label
            );

            panic!("Unable to bridge necessary type, panicing");
        },
    }
}

/// Like `c_str_to_string`, but null and empty strings come back as `None`.
pub(crate) fn c_str_to_optional_path(string: *const c_char, fn_label: &str, err_label: &str) -> Option<PathBuf> {
    if string.is_null() {
        return None;
    }

    let value = c_str_to_string(string, fn_label, err_label);

    match value.is_empty() {
        true => None,
        false => Some(PathBuf::from(value)),
    }
}

pub(crate) fn c_str_to_optional_string(string: *const c_char, fn_label: &str, err_label: &str) -> Option<String> {
    if string.is_null() {
        return None;
    }

    Some(c_str_to_string(string, fn_label, err_label)).filter(|value| !value.is_empty())
}

/// Hands a string to the host. The host must give it back via `krec_string_free`.
pub(crate) fn string_to_c(value: String, fn_label: &str) -> *mut c_char {
    match CString::new(value) {
        Ok(string) => string.into_raw(),

        Err(error) => {
            tracing::error!(target: Log::Core, ?error, "[{}] String contained a NUL byte", fn_label);
            std::ptr::null_mut()
        },
    }
}

/// Frees a string previously returned by this library.
#[unsafe(no_mangle)]
pub extern "C" fn krec_string_free(string: *mut c_char) {
    if string.is_null() {
        return;
    }

    // Only strings produced by `string_to_c` are ever handed out.
    let _string = unsafe { CString::from_raw(string) };
}
