/// Bytes per pixel for the RGB24 frames we capture.
pub const BYTES_PER_PIXEL: usize = 3;

/// Size in bytes of an RGB24 frame.
pub fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

/// Copies `src` into `dst` with the row order reversed.
///
/// The core hands frames over bottom-up while the encoder wants them top-down.
/// `dst` is resized to fit.
pub fn flip_vertical(src: &[u8], dst: &mut Vec<u8>, width: u32, height: u32) {
    let stride = width as usize * BYTES_PER_PIXEL;
    let len = frame_len(width, height);

    dst.resize(len, 0);

    if stride == 0 {
        return;
    }

    for (dst_row, src_row) in dst.chunks_exact_mut(stride).zip(src[..len].chunks_exact(stride).rev()) {
        dst_row.copy_from_slice(src_row);
    }
}
