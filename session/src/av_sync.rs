//! Aligns the video timeline with the audio captured alongside it.
//!
//! Video is encoded at a fixed, usually integer, frame rate while the console's real
//! frame rate is slightly off (59.94 vs 60 and so on). Audio is captured at the real
//! rate, so stretching video timestamps by `audio duration / video duration` makes both
//! streams end together.

/// Bytes per stereo sample pair of 16-bit audio.
pub const BYTES_PER_SAMPLE_FRAME: u64 = 4;

/// Sample rate assumed when the audio plugin can't tell us.
pub const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 33600;

/// Figures gathered over a session, used only once it's over.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize)]
pub struct SessionStats {
    pub captured_frame_count: u32,
    pub requested_frame_rate: f64,
    pub audio_byte_count: u64,
    pub audio_sample_rate: u32,
}

impl SessionStats {
    /// Seconds of captured audio.
    pub fn audio_duration(&self) -> f64 {
        if self.audio_sample_rate == 0 {
            return 0.0;
        }

        self.audio_byte_count as f64 / (self.audio_sample_rate as u64 * BYTES_PER_SAMPLE_FRAME) as f64
    }

    /// Seconds of video at the requested frame rate.
    pub fn video_duration(&self) -> f64 {
        if self.requested_frame_rate <= 0.0 {
            return 0.0;
        }

        self.captured_frame_count as f64 / self.requested_frame_rate
    }

    /// Factor to scale video timestamps by. `1.0` whenever either duration is unknown.
    pub fn av_scale(&self) -> f64 {
        let audio = self.audio_duration();
        let video = self.video_duration();

        if audio > 0.0 && video > 0.0 {
            audio / video
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(audio_byte_count: u64, captured_frame_count: u32, requested_frame_rate: f64) -> SessionStats {
        SessionStats {
            captured_frame_count,
            requested_frame_rate,
            audio_byte_count,
            audio_sample_rate: DEFAULT_AUDIO_SAMPLE_RATE,
        }
    }

    #[test]
    fn ten_seconds_of_audio_against_598_frames() {
        let stats = stats(33600 * 4 * 10, 598, 60.0);

        assert!((stats.audio_duration() - 10.0).abs() < 1e-9);
        assert!((stats.video_duration() - 9.9667).abs() < 1e-3);
        assert!((stats.av_scale() - 1.0033).abs() < 1e-4);
    }

    #[test]
    fn matching_durations_scale_by_one() {
        let stats = stats(33600 * 4 * 5, 300, 60.0);
        assert!((stats.av_scale() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn missing_inputs_fall_back_to_one() {
        assert_eq!(stats(0, 598, 60.0).av_scale(), 1.0);
        assert_eq!(stats(33600 * 4, 0, 60.0).av_scale(), 1.0);
        assert_eq!(stats(33600 * 4, 598, 0.0).av_scale(), 1.0);
        assert_eq!(stats(33600 * 4, 598, -60.0).av_scale(), 1.0);

        let mut no_rate = stats(33600 * 4, 598, 60.0);
        no_rate.audio_sample_rate = 0;
        assert_eq!(no_rate.av_scale(), 1.0);
    }
}
