use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use mupen_integrations::Log;

use crate::SessionError;

/// Combines the encoded video with the raw audio capture into the final file.
#[derive(Clone, Debug)]
pub struct MuxJob {
    pub ffmpeg_path: PathBuf,
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
    pub audio_sample_rate: u32,

    /// Applied to video timestamps; see `SessionStats::av_scale`.
    pub scale: f64,
    pub output_path: PathBuf,
}

impl MuxJob {
    pub fn command_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into(), "-itsscale".into(), format!("{:.6}", self.scale).into()];

        args.push("-i".into());
        args.push(self.video_path.clone().into_os_string());
        args.extend(["-f", "s16le", "-ar"].map(OsString::from));
        args.push(self.audio_sample_rate.to_string().into());
        args.extend(["-ac", "2", "-i"].map(OsString::from));
        args.push(self.audio_path.clone().into_os_string());
        args.extend(["-c:v", "copy", "-c:a", "aac", "-b:a", "192k", "-shortest"].map(OsString::from));
        args.push(self.output_path.clone().into_os_string());

        args
    }

    /// Runs ffmpeg to completion, logging whatever it prints.
    pub fn run(&self) -> Result<(), SessionError> {
        let args = self.command_args();

        tracing::info!(target: Log::Encoder, program = ?self.ffmpeg_path, ?args, "Muxing audio");

        let output = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|error| SessionError::Mux {
                output: self.output_path.clone(),
                reason: error.to_string(),
            })?;

        for line in String::from_utf8_lossy(&output.stderr)
            .lines()
            .chain(String::from_utf8_lossy(&output.stdout).lines())
            .filter(|line| !line.trim().is_empty())
        {
            tracing::info!(target: Log::Encoder, "{line}");
        }

        if !output.status.success() {
            return Err(SessionError::Mux {
                output: self.output_path.clone(),
                reason: output.status.to_string(),
            });
        }

        Ok(())
    }
}
