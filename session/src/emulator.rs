//! The seam between a session and the emulation core that hosts it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use krec_playback::types::PifChannel;

use crate::SessionError;

/// Commands the session may issue from inside a core callback.
pub trait CoreCommands {
    /// Emulation speed in percent of real time.
    fn set_speed_factor(&mut self, percent: u32);

    /// Asks the core to return from `EmulationCore::execute` once the current frame
    /// completes.
    fn stop(&mut self);
}

/// Callbacks the core invokes while executing.
pub trait CoreCallbacks {
    /// Called on every PIF controller poll, possibly several times per frame.
    fn on_controller_poll(&mut self, channels: &mut [PifChannel<'_>]);

    /// Called once a frame has been rendered.
    fn on_frame_rendered(&mut self, frame_index: u32, core: &mut dyn CoreCommands);
}

/// What the audio capture plugin recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioStats {
    pub bytes: u64,
    pub sample_rate: u32,
}

/// A loaded emulation core with a ROM opened and plugins attached.
pub trait EmulationCore {
    /// Prepares controllers for a replay with `player_count` players.
    fn prepare(&mut self, _player_count: usize) -> Result<(), SessionError> {
        Ok(())
    }

    /// Points the audio capture plugin at `path`. Returns `false` when audio capture
    /// isn't available, in which case the output has no audio.
    fn set_audio_output(&mut self, path: &Path) -> bool;

    /// Runs emulation until a callback calls `CoreCommands::stop` or the core exits on
    /// its own.
    fn execute(&mut self, callbacks: &mut dyn CoreCallbacks) -> Result<(), SessionError>;

    /// Audio captured during `execute`, or `None` without an audio plugin.
    fn audio_stats(&self) -> Option<AudioStats>;
}

/// A cancellation flag shared with whoever drives the session. Polled once per frame.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}
