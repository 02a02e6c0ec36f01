//! A conversion session: replay a recording through the core, capture what it renders
//! and produce the final video.
//!
//! The `Session` owns everything one conversion needs. Nothing here is global, so
//! several sessions can exist in one process (one per core instance).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use mupen_integrations::Log;

use krec_capture::{
    CaptureError, CaptureMode, CapturePipeline, EncoderConfig, EncoderFactory, FfmpegEncoderFactory, FrameSource,
    Progress, ProgressFn, VideoCodec,
};
use krec_config::ConvertSettings;
use krec_playback::types::PifChannel;
use krec_playback::ReplaySynchronizer;

pub mod av_sync;
pub mod batch;
pub mod emulator;
pub mod mux;

mod errors;
pub use errors::SessionError;

use crate::av_sync::{SessionStats, DEFAULT_AUDIO_SAMPLE_RATE};
use crate::emulator::{AudioStats, CancelFlag, CoreCallbacks, CoreCommands, EmulationCore};
use crate::mux::MuxJob;

/// Input, output and settings for one conversion.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub settings: ConvertSettings,
}

impl SessionConfig {
    /// Without an explicit output the video lands next to the input as `.mp4`.
    pub fn new(input_path: impl Into<PathBuf>, output_path: Option<&Path>, settings: ConvertSettings) -> Self {
        let input_path = input_path.into();
        let output_path = batch::output_path_for(&input_path, output_path);

        Self {
            input_path,
            output_path,
            settings,
        }
    }

    pub fn temp_video_path(&self) -> PathBuf {
        with_suffix(&self.output_path, ".tmp_v.mp4")
    }

    pub fn temp_audio_path(&self) -> PathBuf {
        with_suffix(&self.output_path, ".tmp_a.raw")
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut path = path.as_os_str().to_os_string();
    path.push(suffix);
    PathBuf::from(path)
}

/// Why emulation stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Every recorded frame was played.
    Completed,

    /// The replay log ended early on a damaged record; everything before it was played.
    TruncatedLog,

    Cancelled,

    /// The core returned before the replay was done.
    CoreStopped,
}

/// What a finished session produced.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SessionReport {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub timeline_frames: usize,
    pub delay_frames: usize,
    pub captured_frames: u32,
    pub skipped_frames: u32,
    pub end_reason: EndReason,
    pub capture_mode: CaptureMode,
    pub stats: SessionStats,
    pub av_scale: f64,

    /// Whether audio was muxed into the output.
    pub muxed: bool,
}

impl SessionReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Temporary outputs of a session, removed when dropped.
#[derive(Debug)]
struct TempFiles {
    video: PathBuf,
    audio: PathBuf,
}

impl TempFiles {
    fn remove(path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => {},
            Err(error) if error.kind() == io::ErrorKind::NotFound => {},

            Err(error) => {
                tracing::warn!(target: Log::Session, ?path, ?error, "Unable to remove temporary file");
            },
        }
    }

    /// Moves the video-only file into place as the final output.
    fn promote_video(&self, output: &Path) -> Result<(), SessionError> {
        Self::remove(output);

        fs::rename(&self.video, output).map_err(|source| SessionError::Io {
            path: output.to_path_buf(),
            source,
        })
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        Self::remove(&self.video);
        Self::remove(&self.audio);
    }
}

/// Runs one conversion. Build with `Session::new`, then call `run` once.
pub struct Session {
    config: SessionConfig,
    core: Box<dyn EmulationCore>,
    source: Option<Box<dyn FrameSource>>,
    factory: Option<Box<dyn EncoderFactory>>,
    progress: Option<ProgressFn>,
    cancel: CancelFlag,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("cancel", &self.cancel)
            .field("has_run", &self.source.is_none())
            .finish()
    }
}

impl Session {
    /// `source` must read from the same video output `core` renders to.
    pub fn new(config: SessionConfig, core: Box<dyn EmulationCore>, source: Box<dyn FrameSource>) -> Self {
        Self {
            config,
            core,
            source: Some(source),
            factory: Some(Box::new(FfmpegEncoderFactory)),
            progress: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_encoder_factory(mut self, factory: impl EncoderFactory + 'static) -> Self {
        self.factory = Some(Box::new(factory));
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// A handle that cancels this session from any thread.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Runs the conversion to completion. Temporary files are cleaned up on every path.
    pub fn run(&mut self) -> Result<SessionReport, SessionError> {
        let (Some(source), Some(factory)) = (self.source.take(), self.factory.take()) else {
            return Err(SessionError::AlreadyRun);
        };

        let input = self.config.input_path.clone();
        let output = self.config.output_path.clone();
        let settings = self.config.settings.clone();

        tracing::info!(target: Log::Session, ?input, ?output, "Starting conversion");

        if self.cancel.is_cancelled() {
            tracing::warn!(target: Log::Session, "Cancelled before start");
            return Err(SessionError::Cancelled);
        }

        let sync = ReplaySynchronizer::open_krec(&input)?;
        let timeline = sync.timeline().clone();

        tracing::info!(target: Log::Replay, "Replay info:\n{}", timeline.summary(settings.fps));

        if timeline.is_empty() {
            tracing::error!(target: Log::Session, ?input, "Replay has no input frames");
            return Err(SessionError::NoInputFrames(input));
        }

        let temp = TempFiles {
            video: self.config.temp_video_path(),
            audio: self.config.temp_audio_path(),
        };

        if self.core.set_audio_output(&temp.audio) {
            tracing::info!(target: Log::Session, path = ?temp.audio, "Audio capture enabled");
        } else {
            tracing::warn!(target: Log::Session, "Audio capture unavailable, output will have no audio");
        }

        self.core.prepare(timeline.player_count())?;

        let encoder = EncoderConfig {
            ffmpeg_path: settings.ffmpeg_path.clone(),
            output_path: temp.video.clone(),
            width: settings.width,
            height: settings.height,
            frame_rate: settings.fps,
            quality: settings.crf,
            codec: VideoCodec::from_name(&settings.encoder),
        };

        tracing::info!(
            target: Log::Session,
            width = encoder.width,
            height = encoder.height,
            fps = encoder.frame_rate,
            crf = encoder.quality,
            codec = encoder.codec.name(),
            "Requested output"
        );

        let total_frames = u32::try_from(timeline.len()).unwrap_or(u32::MAX);
        let pipeline = CapturePipeline::new(source, factory, encoder, total_frames, self.progress.clone());
        let mut driver = Driver::new(sync, pipeline, self.cancel.clone(), settings.speed_factor);

        tracing::info!(target: Log::Session, frames = timeline.len(), "Running emulation");

        let executed = self.core.execute(&mut driver);

        let Driver {
            sync,
            mut pipeline,
            cancelled,
            error,
            ..
        } = driver;

        let finished = pipeline.finish();

        executed?;

        if let Some(error) = error {
            return Err(error.into());
        }

        let summary = finished?;

        let end_reason = if cancelled {
            EndReason::Cancelled
        } else if !sync.is_finished() {
            EndReason::CoreStopped
        } else if timeline.is_truncated() {
            EndReason::TruncatedLog
        } else {
            EndReason::Completed
        };

        tracing::info!(
            target: Log::Session,
            captured = summary.frames,
            played = sync.current_frame(),
            ?end_reason,
            "Emulation finished"
        );

        if summary.frames == 0 {
            tracing::warn!(target: Log::Session, "No frames were captured");

            return Err(match end_reason {
                EndReason::Cancelled => SessionError::Cancelled,
                _ => SessionError::NoFramesCaptured,
            });
        }

        if end_reason != EndReason::Completed {
            tracing::warn!(target: Log::Session, ?end_reason, "Output is shorter than the replay");
        }

        let audio = self.core.audio_stats().unwrap_or(AudioStats {
            bytes: 0,
            sample_rate: DEFAULT_AUDIO_SAMPLE_RATE,
        });

        let stats = SessionStats {
            captured_frame_count: summary.frames,
            requested_frame_rate: settings.fps,
            audio_byte_count: audio.bytes,
            audio_sample_rate: if audio.sample_rate > 0 { audio.sample_rate } else { DEFAULT_AUDIO_SAMPLE_RATE },
        };

        tracing::info!(
            target: Log::Session,
            bytes = stats.audio_byte_count,
            sample_rate = stats.audio_sample_rate,
            "Audio capture"
        );

        let av_scale = stats.av_scale();
        let mut muxed = false;

        if stats.audio_byte_count > 0 {
            if let Some(progress) = &self.progress {
                progress(Progress::Muxing);
            }

            tracing::info!(
                target: Log::Session,
                video = stats.video_duration(),
                audio = stats.audio_duration(),
                scale = av_scale,
                "A/V sync"
            );

            let job = MuxJob {
                ffmpeg_path: settings.ffmpeg_path.clone(),
                video_path: temp.video.clone(),
                audio_path: temp.audio.clone(),
                audio_sample_rate: stats.audio_sample_rate,
                scale: av_scale,
                output_path: output.clone(),
            };

            match job.run() {
                Ok(()) => muxed = true,

                Err(error) => {
                    tracing::error!(target: Log::Session, ?error, "Mux failed, keeping video-only output");
                    temp.promote_video(&output)?;
                },
            }
        } else {
            tracing::info!(target: Log::Session, "No audio captured, keeping video-only output");
            temp.promote_video(&output)?;
        }

        let report = SessionReport {
            input_path: input,
            output_path: output,
            timeline_frames: timeline.len(),
            delay_frames: timeline.delay_frame_count(),
            captured_frames: summary.frames,
            skipped_frames: summary.skipped,
            end_reason,
            capture_mode: summary.mode,
            stats,
            av_scale,
            muxed,
        };

        tracing::info!(target: Log::Session, output = ?report.output_path, "Output saved");
        Ok(report)
    }
}

/// Receives core callbacks for the duration of `EmulationCore::execute`.
struct Driver {
    sync: ReplaySynchronizer,
    pipeline: CapturePipeline,
    cancel: CancelFlag,
    speed_factor: u32,
    speed_applied: bool,
    stopped: bool,
    cancelled: bool,
    error: Option<CaptureError>,
}

impl Driver {
    fn new(sync: ReplaySynchronizer, pipeline: CapturePipeline, cancel: CancelFlag, speed_factor: u32) -> Self {
        Self {
            sync,
            pipeline,
            cancel,
            speed_factor,
            speed_applied: false,
            stopped: false,
            cancelled: false,
            error: None,
        }
    }

    fn stop(&mut self, core: &mut dyn CoreCommands) {
        self.stopped = true;
        core.stop();
    }
}

impl CoreCallbacks for Driver {
    fn on_controller_poll(&mut self, channels: &mut [PifChannel<'_>]) {
        self.sync.on_controller_poll(channels);
    }

    fn on_frame_rendered(&mut self, frame_index: u32, core: &mut dyn CoreCommands) {
        if self.stopped {
            return;
        }

        if self.cancel.is_cancelled() {
            tracing::warn!(target: Log::Session, frame_index, "Cancellation requested, stopping");
            self.cancelled = true;
            self.stop(core);
            return;
        }

        if !self.speed_applied {
            core.set_speed_factor(self.speed_factor);
            self.speed_applied = true;

            tracing::info!(target: Log::Session, percent = self.speed_factor, "Speed factor set");
        }

        self.sync.reset_tick();

        if self.sync.is_finished() {
            self.stop(core);
            return;
        }

        if let Err(error) = self.pipeline.capture_frame() {
            tracing::error!(target: Log::Capture, ?error, frame_index, "Capture failed, stopping");
            self.error = Some(error);
            self.stop(core);
        }
    }
}
