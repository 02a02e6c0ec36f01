//! Binds the host's function pointers to the session's `EmulationCore` and
//! `FrameSource` traits.
//!
//! The host runs the emulation loop. While `execute_fn` is running it reports core events
//! back through `krec_core_on_controller_poll` and `krec_core_on_frame_rendered`, passing
//! along the `dispatch` value it was handed.

use std::ffi::{CString, c_char, c_int};
use std::path::Path;

use krec_capture::{CaptureError, FrameSource, TransferBuffer};
use krec_playback::types::{JoybusCommand, PifChannel};
use krec_session::SessionError;
use krec_session::emulator::{AudioStats, CoreCallbacks, CoreCommands, EmulationCore};
use mupen_integrations::Log;

/// Runs the core until it is stopped. `dispatch` must be passed to the `krec_core_on_*`
/// functions for the duration of the call. Returns `false` if emulation could not start.
pub type ExecuteFn = unsafe extern "C" fn(host_ctx: usize, dispatch: usize) -> bool;
pub type StopFn = unsafe extern "C" fn(host_ctx: usize);
pub type SetSpeedFactorFn = unsafe extern "C" fn(host_ctx: usize, percent: c_int);

/// Reads the current frame. With a null `dest`, only writes the render size to `width`
/// and `height`. Otherwise fills `dest` (`width * height * 3` bytes, RGB24, bottom-up).
pub type ReadScreenFn =
    unsafe extern "C" fn(host_ctx: usize, dest: *mut u8, width: *mut c_int, height: *mut c_int) -> bool;

/// Creates a pixel transfer buffer of `size` bytes. Returns its id, or 0 on failure.
pub type CreateTransferBufferFn = unsafe extern "C" fn(host_ctx: usize, size: usize) -> u32;
pub type RequestReadbackFn = unsafe extern "C" fn(host_ctx: usize, buffer: u32, width: c_int, height: c_int) -> bool;
pub type RetrieveReadbackFn = unsafe extern "C" fn(host_ctx: usize, buffer: u32, dest: *mut u8, len: usize) -> bool;
pub type ReleaseTransferBufferFn = unsafe extern "C" fn(host_ctx: usize, buffer: u32);

pub type PrepareFn = unsafe extern "C" fn(host_ctx: usize, player_count: c_int) -> bool;
pub type SetAudioOutputFn = unsafe extern "C" fn(host_ctx: usize, path: *const c_char) -> bool;
pub type AudioByteCountFn = unsafe extern "C" fn(host_ctx: usize) -> u64;
pub type AudioSampleRateFn = unsafe extern "C" fn(host_ctx: usize) -> u32;

/// Reports encoding progress. `current == -1` means capture is done and the audio is
/// being muxed. May be called from a background thread.
pub type ProgressFn = unsafe extern "C" fn(host_ctx: usize, current: c_int, total: c_int);

/// One PIF channel as the core lays it out: pointers to the transmit/receive length
/// bytes and to the command/response buffers. Any of them may be null.
#[repr(C)]
#[derive(Debug)]
pub struct KrecPifChannel {
    pub tx: *const u8,
    pub tx_buf: *const u8,
    pub rx: *mut u8,
    pub rx_buf: *mut u8,
}

impl KrecPifChannel {
    /// Views the raw channel as a `PifChannel`.
    ///
    /// # Safety
    ///
    /// Every non-null pointer must be valid for the lifetime `'a`, and `rx_buf` must have room
    /// for the response to whatever command `tx_buf` holds.
    unsafe fn as_channel<'a>(&self) -> PifChannel<'a> {
        let command = match self.tx.is_null() || self.tx_buf.is_null() {
            true => None,
            false => Some(unsafe { *self.tx_buf }),
        };

        let response = match (command, self.rx_buf.is_null()) {
            (Some(command), false) => {
                let len = JoybusCommand::from(command).response_len();
                Some(unsafe { std::slice::from_raw_parts_mut(self.rx_buf, len) })
            },

            _ => None,
        };

        PifChannel {
            command,
            status: unsafe { self.rx.as_mut() },
            response,
        }
    }
}

/// The host's callbacks, copied out of the session config.
#[derive(Clone, Copy, Debug)]
pub struct HostHooks {
    pub host_ctx: usize,
    pub execute_fn: ExecuteFn,
    pub stop_fn: StopFn,
    pub set_speed_factor_fn: SetSpeedFactorFn,
    pub read_screen_fn: ReadScreenFn,
    pub create_transfer_buffer_fn: Option<CreateTransferBufferFn>,
    pub request_readback_fn: Option<RequestReadbackFn>,
    pub retrieve_readback_fn: Option<RetrieveReadbackFn>,
    pub release_transfer_buffer_fn: Option<ReleaseTransferBufferFn>,
    pub prepare_fn: Option<PrepareFn>,
    pub set_audio_output_fn: Option<SetAudioOutputFn>,
    pub audio_byte_count_fn: Option<AudioByteCountFn>,
    pub audio_sample_rate_fn: Option<AudioSampleRateFn>,
    pub progress_fn: Option<ProgressFn>,
}

/// The host's emulation core.
#[derive(Debug)]
pub struct HostCore {
    hooks: HostHooks,
}

impl HostCore {
    pub fn new(hooks: HostHooks) -> Self {
        Self { hooks }
    }
}

/// What `dispatch` points at while `execute_fn` runs.
struct Dispatch<'a> {
    callbacks: &'a mut dyn CoreCallbacks,
    commands: HostCommands,
}

struct HostCommands {
    hooks: HostHooks,
}

impl CoreCommands for HostCommands {
    fn set_speed_factor(&mut self, percent: u32) {
        let percent = c_int::try_from(percent).unwrap_or(c_int::MAX);

        tracing::info!(target: Log::Core, percent, "Setting speed factor");
        unsafe { (self.hooks.set_speed_factor_fn)(self.hooks.host_ctx, percent) };
    }

    fn stop(&mut self) {
        tracing::info!(target: Log::Core, "Stopping emulation");
        unsafe { (self.hooks.stop_fn)(self.hooks.host_ctx) };
    }
}

impl EmulationCore for HostCore {
    fn prepare(&mut self, player_count: usize) -> Result<(), SessionError> {
        let Some(prepare_fn) = self.hooks.prepare_fn else {
            return Ok(());
        };

        let players = c_int::try_from(player_count).unwrap_or(c_int::MAX);

        match unsafe { prepare_fn(self.hooks.host_ctx, players) } {
            true => Ok(()),
            false => Err(SessionError::Core(format!("Unable to prepare controllers for {player_count} players"))),
        }
    }

    fn set_audio_output(&mut self, path: &Path) -> bool {
        let Some(set_audio_output_fn) = self.hooks.set_audio_output_fn else {
            return false;
        };

        let path = match CString::new(path.to_string_lossy().into_owned()) {
            Ok(path) => path,

            Err(error) => {
                tracing::error!(target: Log::Core, ?error, "Audio output path contains a NUL byte");
                return false;
            },
        };

        unsafe { set_audio_output_fn(self.hooks.host_ctx, path.as_ptr()) }
    }

    fn execute(&mut self, callbacks: &mut dyn CoreCallbacks) -> Result<(), SessionError> {
        let mut dispatch = Dispatch {
            callbacks,
            commands: HostCommands { hooks: self.hooks },
        };

        let dispatch_ptr = &mut dispatch as *mut Dispatch<'_> as usize;

        tracing::info!(target: Log::Core, "Handing control to the core");

        // `dispatch` outlives the call, and the host only uses the pointer inside it.
        let started = unsafe { (self.hooks.execute_fn)(self.hooks.host_ctx, dispatch_ptr) };

        tracing::info!(target: Log::Core, started, "Core returned");

        match started {
            true => Ok(()),
            false => Err(SessionError::Core("Emulation failed to start".into())),
        }
    }

    fn audio_stats(&self) -> Option<AudioStats> {
        let byte_count_fn = self.hooks.audio_byte_count_fn?;
        let sample_rate_fn = self.hooks.audio_sample_rate_fn?;

        Some(AudioStats {
            bytes: unsafe { byte_count_fn(self.hooks.host_ctx) },
            sample_rate: unsafe { sample_rate_fn(self.hooks.host_ctx) },
        })
    }
}

/// Borrows the `Dispatch` behind a pointer handed to `execute_fn`.
fn with_dispatch<F>(dispatch: usize, fn_label: &str, handler: F)
where
    F: FnOnce(&mut Dispatch<'_>),
{
    if dispatch == 0 {
        tracing::error!(target: Log::Core, "[{}] Called with a null dispatch", fn_label);
        return;
    }

    // The host only calls back with the pointer it was given, on the thread running
    // `execute_fn`, before `execute_fn` returns.
    let dispatch = unsafe { &mut *(dispatch as *mut Dispatch<'_>) };

    handler(dispatch);
}

/// The core should call this from its PIF controller poll, with the four controller
/// channels in order.
#[unsafe(no_mangle)]
pub extern "C" fn krec_core_on_controller_poll(dispatch: usize, channels: *mut KrecPifChannel, count: c_int) {
    let count = usize::try_from(count).unwrap_or(0);

    if channels.is_null() || count == 0 {
        return;
    }

    with_dispatch(dispatch, "krec_core_on_controller_poll", |dispatch| {
        // The host passes `count` channels that stay valid for the duration of this call.
        let raw = unsafe { std::slice::from_raw_parts(channels, count) };
        let mut channels: Vec<PifChannel<'_>> = raw.iter().map(|channel| unsafe { channel.as_channel() }).collect();

        dispatch.callbacks.on_controller_poll(&mut channels);
    });
}

/// The core should call this once per rendered frame (its frame callback).
#[unsafe(no_mangle)]
pub extern "C" fn krec_core_on_frame_rendered(dispatch: usize, frame_index: c_int) {
    with_dispatch(dispatch, "krec_core_on_frame_rendered", |dispatch| {
        let frame_index = u32::try_from(frame_index).unwrap_or(0);
        dispatch.callbacks.on_frame_rendered(frame_index, &mut dispatch.commands);
    });
}

/// Reads frames through the host's screen and pixel transfer hooks.
#[derive(Debug)]
pub struct HostScreen {
    hooks: HostHooks,
}

impl HostScreen {
    pub fn new(hooks: HostHooks) -> Self {
        Self { hooks }
    }

    fn to_c_dims(width: u32, height: u32) -> (c_int, c_int) {
        (
            c_int::try_from(width).unwrap_or(c_int::MAX),
            c_int::try_from(height).unwrap_or(c_int::MAX),
        )
    }
}

impl FrameSource for HostScreen {
    fn frame_size(&mut self) -> Option<(u32, u32)> {
        let (mut width, mut height): (c_int, c_int) = (0, 0);

        let ok = unsafe { (self.hooks.read_screen_fn)(self.hooks.host_ctx, std::ptr::null_mut(), &mut width, &mut height) };

        match (ok, u32::try_from(width), u32::try_from(height)) {
            (true, Ok(width), Ok(height)) if width > 0 && height > 0 => Some((width, height)),
            _ => None,
        }
    }

    fn read_pixels(&mut self, dest: &mut [u8], width: u32, height: u32) -> Result<(), CaptureError> {
        let expected = krec_capture::flip::frame_len(width, height);

        if dest.len() != expected {
            return Err(CaptureError::FrameSize {
                expected,
                actual: dest.len(),
            });
        }

        let (mut read_width, mut read_height) = Self::to_c_dims(width, height);

        let ok = unsafe {
            (self.hooks.read_screen_fn)(self.hooks.host_ctx, dest.as_mut_ptr(), &mut read_width, &mut read_height)
        };

        if !ok {
            return Err(CaptureError::Readback("The host could not read the screen".into()));
        }

        if (read_width, read_height) != Self::to_c_dims(width, height) {
            return Err(CaptureError::Readback(format!(
                "Screen is {read_width}x{read_height}, expected {width}x{height}"
            )));
        }

        Ok(())
    }

    fn supports_async_readback(&self) -> bool {
        self.hooks.create_transfer_buffer_fn.is_some()
            && self.hooks.request_readback_fn.is_some()
            && self.hooks.retrieve_readback_fn.is_some()
            && self.hooks.release_transfer_buffer_fn.is_some()
    }

    fn create_transfer_buffer(&mut self, size: usize) -> Result<TransferBuffer, CaptureError> {
        let create_fn = self.hooks.create_transfer_buffer_fn.ok_or(CaptureError::ReadbackUnavailable)?;

        match unsafe { create_fn(self.hooks.host_ctx, size) } {
            0 => Err(CaptureError::Readback("The host could not create a transfer buffer".into())),
            id => Ok(TransferBuffer(id)),
        }
    }

    fn request_readback(&mut self, buffer: TransferBuffer, width: u32, height: u32) -> Result<(), CaptureError> {
        let request_fn = self.hooks.request_readback_fn.ok_or(CaptureError::ReadbackUnavailable)?;
        let (width, height) = Self::to_c_dims(width, height);

        match unsafe { request_fn(self.hooks.host_ctx, buffer.0, width, height) } {
            true => Ok(()),
            false => Err(CaptureError::Readback(format!("Readback into buffer {} failed", buffer.0))),
        }
    }

    fn retrieve_readback(&mut self, buffer: TransferBuffer, dest: &mut [u8]) -> Result<(), CaptureError> {
        let retrieve_fn = self.hooks.retrieve_readback_fn.ok_or(CaptureError::ReadbackUnavailable)?;

        match unsafe { retrieve_fn(self.hooks.host_ctx, buffer.0, dest.as_mut_ptr(), dest.len()) } {
            true => Ok(()),
            false => Err(CaptureError::Readback(format!("Mapping buffer {} failed", buffer.0))),
        }
    }

    fn release_transfer_buffer(&mut self, buffer: TransferBuffer) {
        if let Some(release_fn) = self.hooks.release_transfer_buffer_fn {
            unsafe { release_fn(self.hooks.host_ctx, buffer.0) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_channels_map_to_sized_responses() {
        let tx = 1u8;
        let tx_buf = [0x01u8];
        let mut rx = 0xC4u8;
        let mut rx_buf = [0u8; 33];

        let raw = KrecPifChannel {
            tx: &tx,
            tx_buf: tx_buf.as_ptr(),
            rx: &mut rx,
            rx_buf: rx_buf.as_mut_ptr(),
        };

        let channel = unsafe { raw.as_channel() };

        assert_eq!(channel.command, Some(0x01));
        assert_eq!(channel.response.as_ref().map(|response| response.len()), Some(4));
        assert_eq!(channel.status.as_deref().copied(), Some(0xC4));
    }

    #[test]
    fn missing_pointers_map_to_none() {
        let raw = KrecPifChannel {
            tx: std::ptr::null(),
            tx_buf: std::ptr::null(),
            rx: std::ptr::null_mut(),
            rx_buf: std::ptr::null_mut(),
        };

        let channel = unsafe { raw.as_channel() };

        assert_eq!(channel.command, None);
        assert!(channel.status.is_none());
        assert!(channel.response.is_none());
    }
}
