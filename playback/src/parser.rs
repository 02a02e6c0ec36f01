//! Parsing for Kaillera `.krec` recordings.
//!
//! A recording is a fixed header followed by a stream of variable-length records. Only
//! input records matter for playback; drop and chat records are skipped.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use mupen_integrations::Log;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::errors::ReplayError;
use crate::types::{BYTES_PER_PLAYER, InputFrame, MAX_PLAYERS};

const HEADER_SIZE_KRC1: usize = 400;
const HEADER_SIZE_KRC0: usize = 272;

const RECORD_INPUT: u8 = 0x12;
const RECORD_DROP: u8 = 0x14;
const RECORD_CHAT: u8 = 0x08;

/// Which revision of the format a recording uses. KRC0 lacks player names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KrecFormat {
    Krc0,
    Krc1,
}

impl KrecFormat {
    fn header_size(self) -> usize {
        match self {
            KrecFormat::Krc0 => HEADER_SIZE_KRC0,
            KrecFormat::Krc1 => HEADER_SIZE_KRC1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            KrecFormat::Krc0 => "KRC0",
            KrecFormat::Krc1 => "KRC1",
        }
    }
}

/// Metadata from the recording header.
#[derive(Clone, Debug)]
pub struct KrecHeader {
    pub format: KrecFormat,
    pub app_name: String,
    pub game_name: String,
    pub timestamp: u32,
    pub player_number: i32,

    /// The player count exactly as recorded; see `ReplayTimeline::player_count` for
    /// the clamped value used during playback.
    pub num_players: i32,
    pub player_names: [String; MAX_PLAYERS],
}

/// The parsed, read-only per-frame input sequence.
#[derive(Clone, Debug)]
pub struct ReplayTimeline {
    header: KrecHeader,
    player_count: usize,
    frames: Vec<InputFrame>,
    delay_frame_count: usize,
    truncated: bool,
}

impl ReplayTimeline {
    pub fn header(&self) -> &KrecHeader {
        &self.header
    }

    /// Player count clamped into `1..=4`.
    pub fn player_count(&self) -> usize {
        self.player_count
    }

    pub fn frames(&self) -> &[InputFrame] {
        &self.frames
    }

    pub fn frame(&self, index: usize) -> Option<&InputFrame> {
        self.frames.get(index)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Leading zero-length records (netplay frame delay). These still occupy a
    /// frame each at the front of `frames`.
    pub fn delay_frame_count(&self) -> usize {
        self.delay_frame_count
    }

    /// Whether parsing stopped early on a damaged or unknown record.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// A human-readable description of the recording, for logs.
    pub fn summary(&self, fps: f64) -> String {
        let header = &self.header;
        let mut out = String::new();

        let _ = writeln!(out, "Format:    {}", header.format.name());
        let _ = writeln!(out, "App:       {}", header.app_name);
        let _ = writeln!(out, "Game:      {}", header.game_name);

        if let Some(date) = format_timestamp(header.timestamp) {
            let _ = writeln!(out, "Date:      {date} UTC");
        }

        let _ = writeln!(out, "Player #:  {}", header.player_number);
        let _ = writeln!(out, "Players:   {}", header.num_players);

        for (index, name) in header.player_names.iter().take(self.player_count).enumerate() {
            if !name.is_empty() {
                let _ = writeln!(out, "  P{}:      {name}", index + 1);
            }
        }

        let _ = writeln!(out, "Frames:    {}", self.frames.len());

        if self.delay_frame_count > 0 {
            let _ = writeln!(out, "Delay:     {} frames", self.delay_frame_count);
        }

        let total_seconds = if fps > 0.0 { (self.frames.len() as f64 / fps) as u64 } else { 0 };
        let _ = write!(
            out,
            "Duration:  {}:{:02} (at {fps:.0} fps)",
            total_seconds / 60,
            total_seconds % 60
        );

        out
    }
}

fn format_timestamp(timestamp: u32) -> Option<String> {
    let date = OffsetDateTime::from_unix_timestamp(timestamp as i64).ok()?;
    date.format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .ok()
}

pub trait ReplayParser: std::fmt::Debug {
    fn parse(&self, path: &Path) -> Result<ReplayTimeline, ReplayError>;
}

/// Parser for `.krec` files.
#[derive(Default, Debug)]
pub struct KrecParser;

impl ReplayParser for KrecParser {
    fn parse(&self, path: &Path) -> Result<ReplayTimeline, ReplayError> {
        let bytes = fs::read(path).map_err(|source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        self.parse_bytes(&bytes)
    }
}

impl KrecParser {
    pub fn parse_bytes(&self, bytes: &[u8]) -> Result<ReplayTimeline, ReplayError> {
        let Some(magic) = bytes.get(..4) else {
            return Err(ReplayError::TooShort {
                len: bytes.len(),
                expected: HEADER_SIZE_KRC0,
            });
        };

        let format = match magic {
            b"KRC1" => KrecFormat::Krc1,
            b"KRC0" => KrecFormat::Krc0,
            _ => return Err(ReplayError::BadMagic([magic[0], magic[1], magic[2], magic[3]])),
        };

        let header_size = format.header_size();
        if bytes.len() < header_size {
            return Err(ReplayError::TooShort {
                len: bytes.len(),
                expected: header_size,
            });
        }

        let header = parse_header(format, bytes);

        let player_count = header.num_players.clamp(1, MAX_PLAYERS as i32) as usize;
        if player_count as i32 != header.num_players {
            tracing::warn!(
                target: Log::Replay,
                recorded = header.num_players,
                clamped = player_count,
                "Player count out of range, clamping"
            );
        }

        let records = parse_records(&bytes[header_size..], player_count);

        Ok(ReplayTimeline {
            header,
            player_count,
            frames: records.frames,
            delay_frame_count: records.delay_frames,
            truncated: records.truncated,
        })
    }
}

fn parse_header(format: KrecFormat, bytes: &[u8]) -> KrecHeader {
    let mut player_names: [String; MAX_PLAYERS] = Default::default();

    if format == KrecFormat::Krc1 {
        for (index, name) in player_names.iter_mut().enumerate() {
            let start = HEADER_SIZE_KRC0 + index * 32;
            *name = c_string(&bytes[start..start + 32]);
        }
    }

    KrecHeader {
        format,
        app_name: c_string(&bytes[4..132]),
        game_name: c_string(&bytes[132..260]),
        timestamp: u32::from_le_bytes([bytes[260], bytes[261], bytes[262], bytes[263]]),
        player_number: i32::from_le_bytes([bytes[264], bytes[265], bytes[266], bytes[267]]),
        num_players: i32::from_le_bytes([bytes[268], bytes[269], bytes[270], bytes[271]]),
        player_names,
    }
}

/// Reads a NUL-terminated string out of a fixed-size field.
fn c_string(field: &[u8]) -> String {
    let end = field.iter().position(|byte| *byte == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

struct ParsedRecords {
    frames: Vec<InputFrame>,
    delay_frames: usize,
    truncated: bool,
}

fn parse_records(body: &[u8], player_count: usize) -> ParsedRecords {
    let bytes_per_frame = player_count * BYTES_PER_PLAYER;
    let mut input = Vec::new();
    let mut delay_frames = 0;
    let mut in_delay = true;
    let mut truncated = false;

    let mut cursor = Cursor { bytes: body, pos: 0 };

    // A record needs at least a type byte and one more byte to mean anything.
    while cursor.remaining() > 1 {
        let Some(record_type) = cursor.read_u8() else { break };

        match record_type {
            RECORD_INPUT => {
                let Some(length) = cursor.read_u16_le() else {
                    truncated = true;
                    break;
                };

                if length == 0 {
                    // Zero-length records are frame delay padding. They still take a
                    // frame slot, otherwise every later frame shifts by one.
                    if in_delay {
                        delay_frames += 1;
                    }

                    input.resize(input.len() + bytes_per_frame, 0);
                    continue;
                }

                let Some(data) = cursor.take(length as usize) else {
                    truncated = true;
                    break;
                };

                in_delay = false;
                input.extend_from_slice(data);
            },

            RECORD_DROP => {
                if !cursor.skip_c_string() || cursor.take(4).is_none() {
                    truncated = true;
                    break;
                }
            },

            RECORD_CHAT => {
                if !cursor.skip_c_string() || !cursor.skip_c_string() {
                    truncated = true;
                    break;
                }
            },

            unknown => {
                tracing::warn!(
                    target: Log::Replay,
                    record_type = unknown,
                    offset = cursor.pos - 1,
                    "Unknown record type, stopping"
                );

                truncated = true;
                break;
            },
        }
    }

    if truncated {
        tracing::warn!(target: Log::Replay, "Replay log ends with a damaged record");
    }

    let remainder = input.len() % bytes_per_frame;
    if remainder != 0 {
        tracing::warn!(
            target: Log::Replay,
            remainder,
            "Dropping trailing partial input frame"
        );
    }

    let frames = input
        .chunks_exact(bytes_per_frame)
        .map(|chunk| {
            let mut frame = InputFrame::default();

            for (word, bytes) in frame.players.iter_mut().zip(chunk.chunks_exact(BYTES_PER_PLAYER)) {
                *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }

            frame
        })
        .collect();

    ParsedRecords {
        frames,
        delay_frames,
        truncated,
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn read_u8(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn read_u16_le(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let slice = self.bytes.get(self.pos..self.pos.checked_add(len)?)?;
        self.pos += len;
        Some(slice)
    }

    /// Skips past the next NUL. Returns `false` if none was found.
    fn skip_c_string(&mut self) -> bool {
        match self.bytes[self.pos..].iter().position(|byte| *byte == 0) {
            Some(offset) => {
                self.pos += offset + 1;
                true
            },

            None => {
                self.pos = self.bytes.len();
                false
            },
        }
    }
}
