use std::ffi::{c_char, c_int};
use std::sync::{Arc, Mutex, PoisonError};

use krec_capture::Progress;
use krec_config::{ConfigError, ConvertSettings, KrecConfig};
use krec_session::emulator::CancelFlag;
use krec_session::{Session, SessionConfig, SessionError, SessionReport};
use mupen_integrations::Log;

use crate::host::{
    AudioByteCountFn, AudioSampleRateFn, CreateTransferBufferFn, ExecuteFn, HostCore, HostHooks, HostScreen, PrepareFn,
    ProgressFn, ReadScreenFn, ReleaseTransferBufferFn, RequestReadbackFn, RetrieveReadbackFn, SetAudioOutputFn,
    SetSpeedFactorFn, StopFn,
};
use crate::{c_str_to_optional_path, c_str_to_optional_string, c_str_to_string, string_to_c, with_returning};

/// A configuration struct for passing everything a conversion needs over from the host.
///
/// Strings marked optional may be null or empty. Numeric overrides use `0` (or a
/// negative `crf`) to mean "use the config file / environment / default value".
#[repr(C)]
pub struct KrecRustSessionConfig {
    // Paths
    pub input_path: *const c_char,
    pub output_path: *const c_char,
    pub config_path: *const c_char,

    // Overrides
    pub ffmpeg_path: *const c_char,
    pub encoder: *const c_char,
    pub crf: c_int,
    pub fps: f64,
    pub width: c_int,
    pub height: c_int,
    pub speed_factor: c_int,

    // Passed back as the first argument of every hook.
    pub host_ctx: usize,

    // Required hooks
    pub execute_fn: ExecuteFn,
    pub stop_fn: StopFn,
    pub set_speed_factor_fn: SetSpeedFactorFn,
    pub read_screen_fn: ReadScreenFn,

    // Pixel transfer hooks. Unless all four are set, frames are read synchronously.
    pub create_transfer_buffer_fn: Option<CreateTransferBufferFn>,
    pub request_readback_fn: Option<RequestReadbackFn>,
    pub retrieve_readback_fn: Option<RetrieveReadbackFn>,
    pub release_transfer_buffer_fn: Option<ReleaseTransferBufferFn>,

    // Optional hooks
    pub prepare_fn: Option<PrepareFn>,
    pub set_audio_output_fn: Option<SetAudioOutputFn>,
    pub audio_byte_count_fn: Option<AudioByteCountFn>,
    pub audio_sample_rate_fn: Option<AudioSampleRateFn>,
    pub progress_fn: Option<ProgressFn>,
}

impl KrecRustSessionConfig {
    fn hooks(&self) -> HostHooks {
        HostHooks {
            host_ctx: self.host_ctx,
            execute_fn: self.execute_fn,
            stop_fn: self.stop_fn,
            set_speed_factor_fn: self.set_speed_factor_fn,
            read_screen_fn: self.read_screen_fn,
            create_transfer_buffer_fn: self.create_transfer_buffer_fn,
            request_readback_fn: self.request_readback_fn,
            retrieve_readback_fn: self.retrieve_readback_fn,
            release_transfer_buffer_fn: self.release_transfer_buffer_fn,
            prepare_fn: self.prepare_fn,
            set_audio_output_fn: self.set_audio_output_fn,
            audio_byte_count_fn: self.audio_byte_count_fn,
            audio_sample_rate_fn: self.audio_sample_rate_fn,
            progress_fn: self.progress_fn,
        }
    }

    /// Overrides from the host, layered on top of the environment and config file.
    fn overrides(&self, fn_name: &str) -> KrecConfig {
        let resolution = match (self.width, self.height) {
            (width, height) if width > 0 && height > 0 => Some(format!("{width}x{height}")),
            _ => None,
        };

        KrecConfig {
            ffmpeg_path: c_str_to_optional_path(self.ffmpeg_path, fn_name, "ffmpeg_path"),
            encoder: c_str_to_optional_string(self.encoder, fn_name, "encoder"),
            crf: u32::try_from(self.crf).ok(),
            fps: Some(self.fps).filter(|fps| *fps > 0.0),
            resolution,
            speed_factor: u32::try_from(self.speed_factor).ok().filter(|speed| *speed > 0),
            verbose: None,
        }
    }

    fn settings(&self, fn_name: &str) -> Result<ConvertSettings, ConfigError> {
        let config_path = c_str_to_optional_path(self.config_path, fn_name, "config_path");

        KrecConfig::load(config_path.as_deref())?
            .merge(self.overrides(fn_name))
            .resolve()
    }
}

/// What the host holds a pointer to.
///
/// `krec_session_cancel` may be called from any thread while `krec_session_run` blocks the
/// emulation thread, so the session sits behind a lock and the cancel flag beside it.
struct KrecSession {
    cancel: CancelFlag,
    session: Mutex<Session>,
    outcome: Mutex<Option<Result<SessionReport, SessionError>>>,
}

/// Creates a conversion session with the provided configuration.
///
/// Returns 0 if the settings are invalid (the reason is logged). Otherwise the host owns
/// the returned pointer until it passes it to `krec_session_destroy`.
#[unsafe(no_mangle)]
pub extern "C" fn krec_session_create(config: KrecRustSessionConfig) -> usize {
    let fn_name = "krec_session_create";

    if config.input_path.is_null() {
        tracing::error!(target: Log::Session, "No input path given");
        return 0;
    }

    let settings = match config.settings(fn_name) {
        Ok(settings) => settings,

        Err(error) => {
            tracing::error!(target: Log::Session, ?error, "Invalid conversion settings");
            return 0;
        },
    };

    if settings.verbose {
        mupen_integrations::logger::set_verbose(true);
    }

    let input = c_str_to_string(config.input_path, fn_name, "input_path");
    let output = c_str_to_optional_path(config.output_path, fn_name, "output_path");
    let session_config = SessionConfig::new(input, output.as_deref(), settings);

    let hooks = config.hooks();
    let mut session = Session::new(session_config, Box::new(HostCore::new(hooks)), Box::new(HostScreen::new(hooks)));

    if let Some(progress_fn) = hooks.progress_fn {
        let host_ctx = hooks.host_ctx;

        session = session.with_progress(Arc::new(move |progress: Progress| {
            let (current, total) = match progress {
                Progress::Frame { current, total } => (
                    c_int::try_from(current).unwrap_or(c_int::MAX),
                    c_int::try_from(total).unwrap_or(c_int::MAX),
                ),

                Progress::Muxing => (-1, 0),
            };

            unsafe { progress_fn(host_ctx, current, total) };
        }));
    }

    let session = Box::new(KrecSession {
        cancel: session.cancel_flag(),
        session: Mutex::new(session),
        outcome: Mutex::new(None),
    });

    let session_instance_ptr = Box::into_raw(session) as usize;

    tracing::info!(
        target: Log::Session,
        ptr = session_instance_ptr,
        "Created conversion session"
    );

    session_instance_ptr
}

/// Runs the conversion on the calling thread, which must be the thread the host runs the
/// core on. Blocks until the output is written or the session fails.
#[unsafe(no_mangle)]
pub extern "C" fn krec_session_run(session_instance_ptr: usize) -> bool {
    with_returning::<KrecSession, _, _>(session_instance_ptr, |instance| {
        let outcome = instance
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .run();

        if let Err(error) = &outcome {
            tracing::error!(target: Log::Session, ?error, "Conversion failed");
        }

        let succeeded = outcome.is_ok();
        *instance.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);

        succeeded
    })
}

/// Asks a running session to stop after the current frame. Safe to call from any thread.
#[unsafe(no_mangle)]
pub extern "C" fn krec_session_cancel(session_instance_ptr: usize) {
    with_returning::<KrecSession, _, _>(session_instance_ptr, |instance| {
        tracing::info!(target: Log::Session, "Cancellation requested");
        instance.cancel.cancel();
    });
}

/// Returns the outcome of `krec_session_run` as JSON: the report on success, or
/// `{"error": "..."}` on failure. Null if the session hasn't run yet. Free the result with
/// `krec_string_free`.
#[unsafe(no_mangle)]
pub extern "C" fn krec_session_report_json(session_instance_ptr: usize) -> *mut c_char {
    let fn_name = "krec_session_report_json";

    with_returning::<KrecSession, _, _>(session_instance_ptr, |instance| {
        let outcome = instance.outcome.lock().unwrap_or_else(PoisonError::into_inner);

        let json = match outcome.as_ref() {
            Some(Ok(report)) => report.to_json(),
            Some(Err(error)) => serde_json::to_string(&serde_json::json!({ "error": error.to_string() })),
            None => return std::ptr::null_mut(),
        };

        match json {
            Ok(json) => string_to_c(json, fn_name),

            Err(error) => {
                tracing::error!(target: Log::Session, ?error, "Unable to serialize session report");
                std::ptr::null_mut()
            },
        }
    })
}

/// The host should call this once it is done with a session. The pointer must not be
/// used afterwards.
#[unsafe(no_mangle)]
pub extern "C" fn krec_session_destroy(session_instance_ptr: usize) {
    tracing::info!(
        target: Log::Session,
        ptr = session_instance_ptr,
        "Destroying conversion session"
    );

    if session_instance_ptr == 0 {
        return;
    }

    // Coerce the instance back from the pointer. This is theoretically safe since we
    // control the host side and can guarantee that the pointer is only owned by us, and
    // is created/destroyed with the corresponding lifetimes.
    let _session = unsafe { Box::from_raw(session_instance_ptr as *mut KrecSession) };
}
