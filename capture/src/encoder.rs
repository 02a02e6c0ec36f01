//! The video encoder side of the pipeline: an `ffmpeg` subprocess fed raw RGB24
//! frames over stdin, or a plain file for debugging.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;

use mupen_integrations::Log;

use crate::CaptureError;

/// Video codecs we know how to drive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VideoCodec {
    #[default]
    Libx264,
    Libx265,
    H264Amf,
    HevcAmf,
    H264Nvenc,
    HevcNvenc,
}

/// Always usable, as long as ffmpeg was built with them.
pub const SOFTWARE_CODECS: [VideoCodec; 2] = [VideoCodec::Libx264, VideoCodec::Libx265];

/// Only usable when the matching GPU and driver are present.
pub const HARDWARE_CODECS: [VideoCodec; 4] = [
    VideoCodec::H264Nvenc,
    VideoCodec::HevcNvenc,
    VideoCodec::H264Amf,
    VideoCodec::HevcAmf,
];

impl VideoCodec {
    /// Resolves an ffmpeg encoder name. Unknown names fall back to libx264.
    pub fn from_name(name: &str) -> Self {
        match name {
            "libx264" => Self::Libx264,
            "libx265" => Self::Libx265,
            "h264_amf" => Self::H264Amf,
            "hevc_amf" => Self::HevcAmf,
            "h264_nvenc" => Self::H264Nvenc,
            "hevc_nvenc" => Self::HevcNvenc,

            unknown => {
                tracing::warn!(target: Log::Encoder, codec = unknown, "Unknown encoder, using libx264");
                Self::Libx264
            },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Libx264 => "libx264",
            Self::Libx265 => "libx265",
            Self::H264Amf => "h264_amf",
            Self::HevcAmf => "hevc_amf",
            Self::H264Nvenc => "h264_nvenc",
            Self::HevcNvenc => "hevc_nvenc",
        }
    }

    pub fn is_hardware(self) -> bool {
        !SOFTWARE_CODECS.contains(&self)
    }

    /// Rate control flags for the given quality level. Lower is better for all of
    /// them.
    pub fn quality_args(self, quality: u32) -> Vec<String> {
        let q = quality.to_string();

        let args: Vec<&str> = match self {
            Self::Libx264 | Self::Libx265 => vec!["-preset", "medium", "-crf", &q],
            Self::H264Amf | Self::HevcAmf => vec!["-quality", "quality", "-rc", "cqp", "-qp_i", &q, "-qp_p", &q],
            Self::H264Nvenc | Self::HevcNvenc => vec!["-preset", "p7", "-rc", "vbr", "-cq", &q],
        };

        args.into_iter().map(String::from).collect()
    }
}

/// Everything needed to start an encoder for one session.
#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub ffmpeg_path: PathBuf,
    pub output_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub quality: u32,
    pub codec: VideoCodec,
}

impl EncoderConfig {
    /// Arguments for an ffmpeg process that reads raw RGB24 frames on stdin.
    pub fn command_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-y",
            "-f",
            "rawvideo",
            "-pixel_format",
            "rgb24",
            "-video_size",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        args.push(format!("{}x{}", self.width, self.height).into());
        args.push("-framerate".into());
        args.push(self.frame_rate.to_string().into());
        args.push("-i".into());
        args.push("pipe:0".into());
        args.push("-c:v".into());
        args.push(self.codec.name().into());
        args.extend(self.codec.quality_args(self.quality).into_iter().map(OsString::from));
        args.push("-pix_fmt".into());
        args.push("yuv420p".into());
        args.push(self.output_path.clone().into_os_string());

        args
    }
}

/// Where captured frames end up.
pub trait VideoSink: Send {
    /// Writes one top-down RGB24 frame.
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), CaptureError>;

    /// Flushes and closes the sink. The output is only valid once this returns `Ok`.
    fn finish(self: Box<Self>) -> Result<(), CaptureError>;
}

impl std::fmt::Debug for dyn VideoSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VideoSink")
    }
}

/// Opens a sink once the actual frame dimensions are known.
pub trait EncoderFactory: Send {
    fn open(&self, config: &EncoderConfig) -> Result<Box<dyn VideoSink>, CaptureError>;
}

/// Spawns ffmpeg.
#[derive(Debug, Default)]
pub struct FfmpegEncoderFactory;

impl EncoderFactory for FfmpegEncoderFactory {
    fn open(&self, config: &EncoderConfig) -> Result<Box<dyn VideoSink>, CaptureError> {
        Ok(Box::new(FfmpegEncoder::spawn(config)?))
    }
}

/// Writes the raw stream to `config.output_path`.
#[derive(Debug, Default)]
pub struct RawVideoFactory;

impl EncoderFactory for RawVideoFactory {
    fn open(&self, config: &EncoderConfig) -> Result<Box<dyn VideoSink>, CaptureError> {
        Ok(Box::new(RawVideoSink::create(&config.output_path)?))
    }
}

/// How many trailing lines of ffmpeg's stderr are kept for diagnostics.
const STDERR_TAIL_LINES: usize = 50;

/// Reads `reader` to the end, keeping the last `STDERR_TAIL_LINES` non-empty lines.
fn collect_tail(reader: impl Read) -> VecDeque<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

    for line in BufReader::new(reader).lines().map_while(Result::ok) {
        if line.trim().is_empty() {
            continue;
        }

        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }

        tail.push_back(line);
    }

    tail
}

/// A running ffmpeg process.
#[derive(Debug)]
pub struct FfmpegEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<thread::JoinHandle<VecDeque<String>>>,
}

impl FfmpegEncoder {
    pub fn spawn(config: &EncoderConfig) -> Result<Self, CaptureError> {
        let args = config.command_args();

        tracing::info!(
            target: Log::Encoder,
            program = ?config.ffmpeg_path,
            ?args,
            "Starting encoder"
        );

        let mut child = Command::new(&config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CaptureError::EncoderSpawn {
                program: config.ffmpeg_path.clone(),
                source,
            })?;

        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::EncoderStdinUnavailable);
        };

        // ffmpeg blocks once the stderr pipe fills up, so it has to be drained continuously.
        let stderr = child.stderr.take().and_then(|stderr| {
            thread::Builder::new()
                .name("KrecEncoderLog".into())
                .spawn(move || collect_tail(stderr))
                .map_err(|error| {
                    tracing::warn!(target: Log::Encoder, ?error, "Unable to capture encoder output");
                })
                .ok()
        });

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr,
        })
    }

    fn stderr_tail(&mut self) -> VecDeque<String> {
        match self.stderr.take().map(thread::JoinHandle::join) {
            Some(Ok(tail)) => tail,
            _ => VecDeque::new(),
        }
    }
}

impl VideoSink for FfmpegEncoder {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), CaptureError> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(frame).map_err(CaptureError::EncoderWrite),
            None => Err(CaptureError::EncoderStdinUnavailable),
        }
    }

    fn finish(mut self: Box<Self>) -> Result<(), CaptureError> {
        // Closing stdin is what tells ffmpeg to finalize the file.
        drop(self.stdin.take());

        let status = self.child.wait().map_err(CaptureError::EncoderWait)?;
        let tail = self.stderr_tail();

        if !status.success() {
            for line in &tail {
                tracing::error!(target: Log::Encoder, "{line}");
            }

            return Err(CaptureError::EncoderExit(status));
        }

        for line in &tail {
            tracing::debug!(target: Log::Encoder, "{line}");
        }

        tracing::info!(target: Log::Encoder, "Encoder finished");
        Ok(())
    }
}

/// Dumps the raw RGB24 stream to a file, without any encoding.
#[derive(Debug)]
pub struct RawVideoSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl RawVideoSink {
    pub fn create(path: &Path) -> Result<Self, CaptureError> {
        let file = File::create(path).map_err(|source| CaptureError::RawOutput {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }
}

impl VideoSink for RawVideoSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), CaptureError> {
        self.writer.write_all(frame).map_err(CaptureError::EncoderWrite)
    }

    fn finish(mut self: Box<Self>) -> Result<(), CaptureError> {
        self.writer.flush().map_err(|source| CaptureError::RawOutput {
            path: self.path.clone(),
            source,
        })
    }
}

/// Whether `ffmpeg_path` points at something that runs.
pub fn check_ffmpeg(ffmpeg_path: &Path) -> bool {
    let status = Command::new(ffmpeg_path)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) => status.success(),

        Err(error) => {
            tracing::warn!(target: Log::Encoder, ?error, path = ?ffmpeg_path, "ffmpeg not found");
            false
        },
    }
}

/// Lists the codecs this machine can encode with. Hardware codecs are only listed if
/// a tiny test encode with them succeeds.
pub fn probe_available_encoders(ffmpeg_path: &Path) -> Vec<VideoCodec> {
    let mut available = SOFTWARE_CODECS.to_vec();

    for codec in HARDWARE_CODECS {
        let status = Command::new(ffmpeg_path)
            .args(["-v", "quiet", "-f", "lavfi", "-i", "nullsrc=s=16x16:d=0.01", "-frames:v", "1"])
            .args(["-c:v", codec.name(), "-f", "null", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        if matches!(status, Ok(status) if status.success()) {
            tracing::info!(target: Log::Encoder, codec = codec.name(), "Hardware encoder available");
            available.push(codec);
        }
    }

    available
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(codec: VideoCodec) -> EncoderConfig {
        EncoderConfig {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            output_path: PathBuf::from("out.tmp_v.mp4"),
            width: 640,
            height: 480,
            frame_rate: 60.0,
            quality: 23,
            codec,
        }
    }

    fn joined(config: &EncoderConfig) -> String {
        config
            .command_args()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn software_command_line() {
        assert_eq!(
            joined(&config(VideoCodec::Libx264)),
            "-y -f rawvideo -pixel_format rgb24 -video_size 640x480 -framerate 60 -i pipe:0 \
             -c:v libx264 -preset medium -crf 23 -pix_fmt yuv420p out.tmp_v.mp4"
        );
    }

    #[test]
    fn hardware_quality_flags() {
        let amf = joined(&config(VideoCodec::HevcAmf));
        assert!(amf.contains("-c:v hevc_amf -quality quality -rc cqp -qp_i 23 -qp_p 23 -pix_fmt yuv420p"));

        let nvenc = joined(&config(VideoCodec::H264Nvenc));
        assert!(nvenc.contains("-c:v h264_nvenc -preset p7 -rc vbr -cq 23 -pix_fmt yuv420p"));
    }

    #[test]
    fn fractional_frame_rates_are_kept() {
        let mut config = config(VideoCodec::Libx264);
        config.frame_rate = 59.94;

        assert!(joined(&config).contains("-framerate 59.94 "));
    }

    #[test]
    fn unknown_codec_falls_back_to_libx264() {
        assert_eq!(VideoCodec::from_name("h264_nvenc"), VideoCodec::H264Nvenc);
        assert_eq!(VideoCodec::from_name("mpeg1video"), VideoCodec::Libx264);
        assert!(!VideoCodec::Libx265.is_hardware());
        assert!(VideoCodec::HevcNvenc.is_hardware());
    }

    #[test]
    fn raw_sink_writes_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.rgb");

        let mut sink: Box<dyn VideoSink> = Box::new(RawVideoSink::create(&path).unwrap());
        sink.write_frame(&[1, 2, 3]).unwrap();
        sink.write_frame(&[4, 5, 6]).unwrap();
        sink.finish().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn missing_ffmpeg_is_reported() {
        assert!(!check_ffmpeg(Path::new("/nonexistent/ffmpeg-for-tests")));
    }

    #[test]
    fn stderr_keeps_only_the_last_lines() {
        let output: String = (0..60).map(|n| format!("line {n}\n\n")).collect();
        let tail = collect_tail(output.as_bytes());

        assert_eq!(tail.len(), STDERR_TAIL_LINES);
        assert_eq!(tail.front().map(String::as_str), Some("line 10"));
        assert_eq!(tail.back().map(String::as_str), Some("line 59"));
    }

    #[cfg(unix)]
    #[test]
    fn failing_encoder_reports_its_exit_status() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ffmpeg");
        std::fs::write(&script, "#!/bin/sh\necho \"Unknown encoder 'bogus'\" >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = config(VideoCodec::Libx264);
        config.ffmpeg_path = script;
        config.output_path = dir.path().join("out.mp4");

        let encoder = Box::new(FfmpegEncoder::spawn(&config).unwrap());
        assert!(matches!(encoder.finish(), Err(CaptureError::EncoderExit(_))));
    }
}
