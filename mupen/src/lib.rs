//! Integration shims shared by every crate in the workspace.
//!
//! The hosting frontend (which loads the emulation core and this library) owns the
//! console window and log view, so anything that needs to reach the user goes through
//! here. At the moment that is logging: the `Log` targets below, and a `tracing` layer
//! that forwards events to a host-provided callback.

pub mod logger;
pub use logger::{ForeignLogFn, MessageLevel};

/// Log targets used throughout the workspace.
///
/// These are passed as the `target:` of `tracing` macros so that the host (and the
/// stderr fallback) can tell which subsystem a message came from:
///
/// ```no_run
/// use mupen_integrations::Log;
///
/// tracing::info!(target: Log::Capture, frames = 10, "Capture finished");
/// ```
#[derive(Debug)]
pub struct Log;

#[allow(non_upper_case_globals)]
impl Log {
    /// Anything interacting with the emulation core itself (speed factor, execute/stop).
    pub const Core: &'static str = "krec_core";

    /// Replay log parsing and input injection.
    pub const Replay: &'static str = "krec_replay";

    /// GPU readback and the encode worker.
    pub const Capture: &'static str = "krec_capture";

    /// The video encoder subprocess and the final mux step.
    pub const Encoder: &'static str = "krec_encoder";

    /// Session orchestration, temp files and reporting.
    pub const Session: &'static str = "krec_session";
}
