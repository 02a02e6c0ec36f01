//! Conversion settings.
//!
//! Values are layered: environment variables first, then an optional TOML file, then
//! whatever the caller overrides explicitly. `KrecConfig::resolve` fills in defaults
//! for anything still unset.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use mupen_integrations::Log;
use thiserror::Error;

/// Frame rate used when none is configured, or when a non-positive one is.
pub const DEFAULT_FPS: f64 = 60.0;

/// Speed factor (percent) applied to the core once emulation starts.
pub const DEFAULT_SPEED_FACTOR: u32 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read config file {path:?}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("Unable to parse config file {path:?}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },

    #[error("Invalid resolution '{0}' (expected WxH)")]
    InvalidResolution(String),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

/// A partially specified configuration. Every field is optional so that layers can
/// be merged.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct KrecConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub encoder: Option<String>,
    pub crf: Option<u32>,
    pub fps: Option<f64>,
    pub resolution: Option<String>,
    pub speed_factor: Option<u32>,
    pub verbose: Option<bool>,
}

/// Fully resolved settings, ready to hand to a session.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvertSettings {
    pub ffmpeg_path: PathBuf,
    pub encoder: String,
    pub crf: u32,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub speed_factor: u32,
    pub verbose: bool,
}

impl Default for ConvertSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            encoder: String::from("libx264"),
            crf: 23,
            fps: DEFAULT_FPS,
            width: 640,
            height: 480,
            speed_factor: DEFAULT_SPEED_FACTOR,
            verbose: false,
        }
    }
}

impl KrecConfig {
    /// Merges two configurations. Values in `other` take precedence.
    pub fn merge(self, other: Self) -> Self {
        Self {
            ffmpeg_path: other.ffmpeg_path.or(self.ffmpeg_path),
            encoder: other.encoder.or(self.encoder),
            crf: other.crf.or(self.crf),
            fps: other.fps.or(self.fps),
            resolution: other.resolution.or(self.resolution),
            speed_factor: other.speed_factor.or(self.speed_factor),
            verbose: other.verbose.or(self.verbose),
        }
    }

    /// Values sourced from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            ffmpeg_path: env::var_os("KREC_FFMPEG").map(PathBuf::from),
            encoder: env::var("KREC_ENCODER").ok(),
            crf: parse_env("KREC_CRF")?,
            fps: parse_env("KREC_FPS")?,
            resolution: env::var("KREC_RESOLUTION").ok(),
            speed_factor: parse_env("KREC_SPEED_FACTOR")?,
            verbose: parse_env("KREC_VERBOSE")?,
        })
    }

    /// Reads a TOML config file off disk.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Environment, then `path` (if any) on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = Self::from_env()?;

        match path {
            Some(path) => {
                tracing::info!(target: Log::Session, ?path, "Loading config file");
                Ok(config.merge(Self::from_file(path)?))
            },

            None => Ok(config),
        }
    }

    /// Fills in defaults and validates.
    pub fn resolve(self) -> Result<ConvertSettings, ConfigError> {
        let defaults = ConvertSettings::default();

        let (width, height) = match self.resolution.as_deref() {
            Some(resolution) => parse_resolution(resolution)?,
            None => (defaults.width, defaults.height),
        };

        // A zero or negative frame rate means "auto", which we settle at 60.
        let fps = match self.fps {
            Some(fps) if fps > 0.0 => fps,
            _ => DEFAULT_FPS,
        };

        Ok(ConvertSettings {
            ffmpeg_path: self.ffmpeg_path.unwrap_or(defaults.ffmpeg_path),
            encoder: self.encoder.unwrap_or(defaults.encoder),
            crf: self.crf.unwrap_or(defaults.crf),
            fps,
            width,
            height,
            speed_factor: self.speed_factor.unwrap_or(defaults.speed_factor),
            verbose: self.verbose.unwrap_or(defaults.verbose),
        })
    }
}

/// Parses a `WxH` resolution string. Both sides must be positive.
pub fn parse_resolution(value: &str) -> Result<(u32, u32), ConfigError> {
    let invalid = || ConfigError::InvalidResolution(value.to_string());

    let (width, height) = value.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
    let width: u32 = width.parse().map_err(|_| invalid())?;
    let height: u32 = height.parse().map_err(|_| invalid())?;

    if width == 0 || height == 0 {
        return Err(invalid());
    }

    Ok((width, height))
}

fn parse_env<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),

        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_take_precedence_over_env_values() {
        let env = KrecConfig {
            encoder: Some("libx265".into()),
            crf: Some(30),
            ..Default::default()
        };

        let file = KrecConfig::from_toml("crf = 18\nresolution = \"1280x960\"\n").unwrap();
        let merged = env.merge(file);

        assert_eq!(merged.encoder.as_deref(), Some("libx265"));
        assert_eq!(merged.crf, Some(18));
        assert_eq!(merged.resolution.as_deref(), Some("1280x960"));
    }

    #[test]
    fn resolve_fills_in_defaults() {
        let settings = KrecConfig::default().resolve().unwrap();
        assert_eq!(settings, ConvertSettings::default());
        assert_eq!(settings.speed_factor, 500);
    }

    #[test]
    fn non_positive_fps_means_auto() {
        let settings = KrecConfig {
            fps: Some(0.0),
            ..Default::default()
        }
        .resolve()
        .unwrap();

        assert_eq!(settings.fps, DEFAULT_FPS);
    }

    #[test]
    fn resolution_parsing() {
        assert_eq!(parse_resolution("640x480").unwrap(), (640, 480));
        assert_eq!(parse_resolution("1920X1440").unwrap(), (1920, 1440));
        assert!(parse_resolution("640").is_err());
        assert!(parse_resolution("0x480").is_err());
        assert!(parse_resolution("-1x480").is_err());
    }

    #[test]
    fn unknown_toml_types_are_rejected() {
        assert!(KrecConfig::from_toml("crf = \"high\"").is_err());
    }

    #[test]
    fn verbose_comes_through_from_the_file() {
        let settings = KrecConfig::default()
            .merge(KrecConfig::from_toml("verbose = true").unwrap())
            .resolve()
            .unwrap();

        assert!(settings.verbose);
        assert!(!KrecConfig::default().resolve().unwrap().verbose);
    }
}
