use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use krec_capture::{CaptureError, CaptureMode, FrameSource, Progress, ProgressFn, RawVideoFactory, TransferBuffer};
use krec_config::ConvertSettings;
use krec_playback::types::PifChannel;
use krec_session::emulator::{AudioStats, CancelFlag, CoreCallbacks, CoreCommands, EmulationCore};
use krec_session::{EndReason, Session, SessionConfig, SessionError};

const WIDTH: u32 = 4;
const HEIGHT: u32 = 2;
const FRAME_LEN: usize = (WIDTH * HEIGHT * 3) as usize;

/// Writes a two player recording where player 1 holds `frame + 1` on every frame.
fn write_replay(dir: &Path, frames: u32, damaged_tail: bool) -> PathBuf {
    let mut bytes = vec![0u8; 400];
    bytes[..4].copy_from_slice(b"KRC1");
    bytes[268..272].copy_from_slice(&2i32.to_le_bytes());

    for frame in 0..frames {
        bytes.push(0x12);
        bytes.extend_from_slice(&8u16.to_le_bytes());
        bytes.extend_from_slice(&(frame + 1).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
    }

    if damaged_tail {
        bytes.extend_from_slice(&[0x77, 0x01, 0x02]);
    }

    let path = dir.join("match.krec");
    fs::write(&path, bytes).unwrap();
    path
}

#[derive(Default)]
struct Screen {
    frame: u32,
    rendered: bool,
    slots: Vec<Vec<u8>>,
}

/// The core's video output. Every byte of frame `n` is `n % 256`.
struct FakeScreen {
    screen: Arc<Mutex<Screen>>,
    async_readback: bool,
}

impl FakeScreen {
    fn pixels(&self) -> Vec<u8> {
        vec![(self.screen.lock().unwrap().frame % 256) as u8; FRAME_LEN]
    }
}

impl FrameSource for FakeScreen {
    fn frame_size(&mut self) -> Option<(u32, u32)> {
        self.screen.lock().unwrap().rendered.then_some((WIDTH, HEIGHT))
    }

    fn read_pixels(&mut self, dest: &mut [u8], _width: u32, _height: u32) -> Result<(), CaptureError> {
        dest.copy_from_slice(&self.pixels());
        Ok(())
    }

    fn supports_async_readback(&self) -> bool {
        self.async_readback
    }

    fn create_transfer_buffer(&mut self, size: usize) -> Result<TransferBuffer, CaptureError> {
        let mut screen = self.screen.lock().unwrap();
        screen.slots.push(vec![0; size]);
        Ok(TransferBuffer(screen.slots.len() as u32 - 1))
    }

    fn request_readback(&mut self, buffer: TransferBuffer, _width: u32, _height: u32) -> Result<(), CaptureError> {
        let pixels = self.pixels();
        self.screen.lock().unwrap().slots[buffer.0 as usize] = pixels;
        Ok(())
    }

    fn retrieve_readback(&mut self, buffer: TransferBuffer, dest: &mut [u8]) -> Result<(), CaptureError> {
        dest.copy_from_slice(&self.screen.lock().unwrap().slots[buffer.0 as usize]);
        Ok(())
    }
}

#[derive(Default)]
struct Commands {
    stopped: bool,
    speed_factor: Option<u32>,
}

impl CoreCommands for Commands {
    fn set_speed_factor(&mut self, percent: u32) {
        self.speed_factor = Some(percent);
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

#[derive(Default)]
struct Observed {
    speed_factor: Option<u32>,
    channel_zero: Vec<[u8; 4]>,
    audio_path: Option<PathBuf>,
    prepared_players: Option<usize>,
}

/// Renders up to `max_frames` frames, polling all four controllers twice per frame.
struct FakeCore {
    screen: Arc<Mutex<Screen>>,
    observed: Arc<Mutex<Observed>>,
    max_frames: u32,
    cancel_after: Option<(u32, CancelFlag)>,
    audio: Option<AudioStats>,
}

impl EmulationCore for FakeCore {
    fn prepare(&mut self, player_count: usize) -> Result<(), SessionError> {
        self.observed.lock().unwrap().prepared_players = Some(player_count);
        Ok(())
    }

    fn set_audio_output(&mut self, path: &Path) -> bool {
        self.observed.lock().unwrap().audio_path = Some(path.to_path_buf());
        self.audio.is_some()
    }

    fn execute(&mut self, callbacks: &mut dyn CoreCallbacks) -> Result<(), SessionError> {
        let mut commands = Commands::default();

        for frame in 0..self.max_frames {
            let mut status = [0u8; 4];
            let mut rx = [[0u8; 33]; 4];

            for _ in 0..2 {
                let mut channels: Vec<PifChannel<'_>> = status
                    .iter_mut()
                    .zip(rx.iter_mut())
                    .map(|(status, rx)| PifChannel {
                        command: Some(0x01),
                        status: Some(status),
                        response: Some(&mut rx[..]),
                    })
                    .collect();

                callbacks.on_controller_poll(&mut channels);
            }

            self.observed
                .lock()
                .unwrap()
                .channel_zero
                .push([rx[0][0], rx[0][1], rx[0][2], rx[0][3]]);

            {
                let mut screen = self.screen.lock().unwrap();
                screen.frame = frame;
                screen.rendered = true;
            }

            callbacks.on_frame_rendered(frame, &mut commands);

            if let Some((after, cancel)) = &self.cancel_after {
                if frame + 1 == *after {
                    cancel.cancel();
                }
            }

            if commands.stopped {
                break;
            }
        }

        self.observed.lock().unwrap().speed_factor = commands.speed_factor;
        Ok(())
    }

    fn audio_stats(&self) -> Option<AudioStats> {
        self.audio
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    observed: Arc<Mutex<Observed>>,
    progress: Arc<Mutex<Vec<Progress>>>,
    session: Session,
}

struct FixtureOptions {
    replay_frames: u32,
    damaged_tail: bool,
    max_frames: u32,
    async_readback: bool,
    cancel_after: Option<u32>,
    audio: Option<AudioStats>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            replay_frames: 500,
            damaged_tail: false,
            max_frames: 600,
            async_readback: false,
            cancel_after: None,
            audio: None,
        }
    }
}

impl Fixture {
    fn new(options: FixtureOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let input = write_replay(dir.path(), options.replay_frames, options.damaged_tail);

        let settings = ConvertSettings {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg-for-tests"),
            width: WIDTH,
            height: HEIGHT,
            ..ConvertSettings::default()
        };

        let config = SessionConfig::new(input, None, settings);
        let screen = Arc::new(Mutex::new(Screen::default()));
        let observed = Arc::new(Mutex::new(Observed::default()));
        let cancel = CancelFlag::new();

        let core = FakeCore {
            screen: screen.clone(),
            observed: observed.clone(),
            max_frames: options.max_frames,
            cancel_after: options.cancel_after.map(|after| (after, cancel.clone())),
            audio: options.audio,
        };

        let source = FakeScreen {
            screen,
            async_readback: options.async_readback,
        };

        let progress = Arc::new(Mutex::new(Vec::new()));
        let seen = progress.clone();
        let progress_fn: ProgressFn = Arc::new(move |progress| seen.lock().unwrap().push(progress));

        let session = Session::new(config, Box::new(core), Box::new(source))
            .with_encoder_factory(RawVideoFactory)
            .with_progress(progress_fn)
            .with_cancel_flag(cancel);

        Self {
            dir,
            observed,
            progress,
            session,
        }
    }

    fn output(&self) -> PathBuf {
        self.dir.path().join("match.mp4")
    }

    /// The frame number of every frame in the output, in order.
    fn output_frames(&self) -> Vec<u8> {
        let bytes = fs::read(self.output()).unwrap();
        assert_eq!(bytes.len() % FRAME_LEN, 0);
        bytes.chunks_exact(FRAME_LEN).map(|frame| frame[0]).collect()
    }

    fn temp_files_exist(&self) -> bool {
        let config = self.session.config();
        config.temp_video_path().exists() || config.temp_audio_path().exists()
    }
}

#[test]
fn full_replay_captures_every_frame() {
    let mut fixture = Fixture::new(FixtureOptions::default());

    let report = fixture.session.run().unwrap();

    assert_eq!(report.timeline_frames, 500);
    assert_eq!(report.captured_frames, 500);
    assert_eq!(report.end_reason, EndReason::Completed);
    assert_eq!(report.capture_mode, CaptureMode::Synchronous);
    assert!(!report.muxed);
    assert_eq!(report.output_path, fixture.output());

    let expected: Vec<u8> = (0..500u32).map(|frame| (frame % 256) as u8).collect();
    assert_eq!(fixture.output_frames(), expected);
    assert!(!fixture.temp_files_exist());

    let observed = fixture.observed.lock().unwrap();
    assert_eq!(observed.speed_factor, Some(500));
    assert_eq!(observed.prepared_players, Some(2));

    // One recorded frame per emulated frame, however often the game polls.
    for (frame, word) in observed.channel_zero.iter().take(500).enumerate() {
        assert_eq!(*word, (frame as u32 + 1).to_be_bytes());
    }

    let progress = fixture.progress.lock().unwrap();
    assert_eq!(progress.len(), 500);
    assert_eq!(progress[499], Progress::Frame { current: 500, total: 500 });
}

#[test]
fn async_readback_keeps_frame_order() {
    let mut fixture = Fixture::new(FixtureOptions {
        async_readback: true,
        ..FixtureOptions::default()
    });

    let report = fixture.session.run().unwrap();

    assert_eq!(report.capture_mode, CaptureMode::Async);
    assert_eq!(report.captured_frames, 500);

    let expected: Vec<u8> = (0..500u32).map(|frame| (frame % 256) as u8).collect();
    assert_eq!(fixture.output_frames(), expected);
}

#[test]
fn cancelling_after_fifty_frames_keeps_a_short_output() {
    for async_readback in [false, true] {
        let mut fixture = Fixture::new(FixtureOptions {
            cancel_after: Some(50),
            async_readback,
            ..FixtureOptions::default()
        });

        let report = fixture.session.run().unwrap();

        assert_eq!(report.end_reason, EndReason::Cancelled);
        assert!(report.captured_frames > 0);
        assert!(report.captured_frames <= 50);
        assert_eq!(fixture.output_frames().len(), report.captured_frames as usize);
        assert!(!fixture.temp_files_exist());
    }
}

#[test]
fn cancelling_before_any_frame_fails() {
    let mut fixture = Fixture::new(FixtureOptions::default());
    fixture.session.cancel_flag().cancel();

    assert!(matches!(fixture.session.run(), Err(SessionError::Cancelled)));
    assert!(!fixture.output().exists());
    assert!(!fixture.temp_files_exist());
}

#[test]
fn no_rendered_frames_is_a_failure() {
    let mut fixture = Fixture::new(FixtureOptions {
        max_frames: 0,
        ..FixtureOptions::default()
    });

    assert!(matches!(fixture.session.run(), Err(SessionError::NoFramesCaptured)));
    assert!(!fixture.output().exists());
    assert!(!fixture.temp_files_exist());
}

#[test]
fn core_exiting_early_is_reported() {
    let mut fixture = Fixture::new(FixtureOptions {
        max_frames: 120,
        ..FixtureOptions::default()
    });

    let report = fixture.session.run().unwrap();

    assert_eq!(report.end_reason, EndReason::CoreStopped);
    assert_eq!(report.captured_frames, 120);
}

#[test]
fn damaged_log_ends_as_truncated() {
    let mut fixture = Fixture::new(FixtureOptions {
        replay_frames: 40,
        damaged_tail: true,
        ..FixtureOptions::default()
    });

    let report = fixture.session.run().unwrap();

    assert_eq!(report.end_reason, EndReason::TruncatedLog);
    assert_eq!(report.captured_frames, 40);
}

#[test]
fn failed_mux_keeps_the_video_only_output() {
    let mut fixture = Fixture::new(FixtureOptions {
        audio: Some(AudioStats {
            bytes: 33600 * 4 * 10,
            sample_rate: 33600,
        }),
        replay_frames: 598,
        max_frames: 700,
        ..FixtureOptions::default()
    });

    let report = fixture.session.run().unwrap();

    assert!(!report.muxed);
    assert!((report.av_scale - 1.0033).abs() < 1e-4);
    assert_eq!(fixture.output_frames().len(), 598);
    assert!(!fixture.temp_files_exist());
    assert_eq!(fixture.progress.lock().unwrap().last(), Some(&Progress::Muxing));

    let audio_path = fixture.observed.lock().unwrap().audio_path.clone();
    assert_eq!(audio_path, Some(fixture.session.config().temp_audio_path()));
}

#[test]
fn sessions_run_once() {
    let mut fixture = Fixture::new(FixtureOptions {
        replay_frames: 5,
        ..FixtureOptions::default()
    });

    let report = fixture.session.run().unwrap();
    assert!(report.to_json().unwrap().contains("\"end_reason\":\"completed\""));

    assert!(matches!(fixture.session.run(), Err(SessionError::AlreadyRun)));
}

#[test]
fn empty_replay_is_rejected() {
    let mut fixture = Fixture::new(FixtureOptions {
        replay_frames: 0,
        ..FixtureOptions::default()
    });

    assert!(matches!(fixture.session.run(), Err(SessionError::NoInputFrames(_))));
}
