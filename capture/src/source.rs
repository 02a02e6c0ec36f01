use crate::CaptureError;

/// Opaque handle to a GPU-side pixel transfer buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferBuffer(pub u32);

/// Reads rendered frames out of the core's video output.
///
/// Frames come back bottom-up, RGB24. The asynchronous methods are optional; a source
/// that doesn't override `supports_async_readback` is captured synchronously.
pub trait FrameSource: Send {
    /// Current render size, or `None` if nothing has been rendered yet.
    fn frame_size(&mut self) -> Option<(u32, u32)>;

    /// Blocking readback into `dest`, which is exactly `width * height * 3` bytes.
    fn read_pixels(&mut self, dest: &mut [u8], width: u32, height: u32) -> Result<(), CaptureError>;

    fn supports_async_readback(&self) -> bool {
        false
    }

    fn create_transfer_buffer(&mut self, _size: usize) -> Result<TransferBuffer, CaptureError> {
        Err(CaptureError::ReadbackUnavailable)
    }

    /// Starts copying the current frame into `buffer` without waiting for it.
    fn request_readback(&mut self, _buffer: TransferBuffer, _width: u32, _height: u32) -> Result<(), CaptureError> {
        Err(CaptureError::ReadbackUnavailable)
    }

    /// Copies a previously requested frame out of `buffer`.
    fn retrieve_readback(&mut self, _buffer: TransferBuffer, _dest: &mut [u8]) -> Result<(), CaptureError> {
        Err(CaptureError::ReadbackUnavailable)
    }

    fn release_transfer_buffer(&mut self, _buffer: TransferBuffer) {}
}
