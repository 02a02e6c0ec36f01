use std::ffi::c_char;
use std::path::PathBuf;

use krec_capture::encoder::{check_ffmpeg, probe_available_encoders};
use mupen_integrations::Log;

use crate::{c_str_to_optional_path, string_to_c};

fn ffmpeg_path(path: *const c_char, fn_name: &str) -> PathBuf {
    c_str_to_optional_path(path, fn_name, "ffmpeg_path").unwrap_or_else(|| PathBuf::from("ffmpeg"))
}

/// Whether ffmpeg can be run from `ffmpeg_path` (null uses `ffmpeg` from `PATH`).
#[unsafe(no_mangle)]
pub extern "C" fn krec_check_ffmpeg(ffmpeg_path_str: *const c_char) -> bool {
    check_ffmpeg(&ffmpeg_path(ffmpeg_path_str, "krec_check_ffmpeg"))
}

/// Returns a JSON array of the encoder names usable on this machine, e.g
/// `["libx264","libx265","h264_nvenc"]`. Free the result with `krec_string_free`.
///
/// This runs a test encode per hardware encoder and can take a few seconds.
#[unsafe(no_mangle)]
pub extern "C" fn krec_encoders_probe(ffmpeg_path_str: *const c_char) -> *mut c_char {
    let fn_name = "krec_encoders_probe";

    let names: Vec<&str> = probe_available_encoders(&ffmpeg_path(ffmpeg_path_str, fn_name))
        .into_iter()
        .map(|codec| codec.name())
        .collect();

    match serde_json::to_string(&names) {
        Ok(json) => string_to_c(json, fn_name),

        Err(error) => {
            tracing::error!(target: Log::Encoder, ?error, "Unable to serialize encoder list");
            std::ptr::null_mut()
        },
    }
}
