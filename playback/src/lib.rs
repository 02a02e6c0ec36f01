//! Replays recorded netplay input into the core's controller polling.
//!
//! `KrecParser` turns a `.krec` file into a `ReplayTimeline`, and a
//! `ReplaySynchronizer` answers the core's joybus polls from it, consuming exactly
//! one recorded frame per emulated frame no matter how often the game polls.

pub mod errors;
pub mod parser;
pub mod state;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use mupen_integrations::Log;

use crate::errors::ReplayError;
use crate::parser::{KrecParser, ReplayParser, ReplayTimeline};
use crate::state::ReplayState;
use crate::types::{CHANNEL_ERROR_BITS, JoybusCommand, NO_PAK, PifChannel, STANDARD_CONTROLLER_STATUS};

/// Drives playback of a single timeline.
#[derive(Debug)]
pub struct ReplaySynchronizer {
    timeline: Arc<ReplayTimeline>,
    state: ReplayState,
}

impl ReplaySynchronizer {
    pub fn new(timeline: Arc<ReplayTimeline>) -> Self {
        Self {
            timeline,
            state: ReplayState::default(),
        }
    }

    /// Loads and parses a recording with the given parser.
    pub fn open(parser: &dyn ReplayParser, path: &Path) -> Result<Self, ReplayError> {
        let timeline = parser.parse(path)?;

        tracing::info!(
            target: Log::Replay,
            path = %path.display(),
            frames = timeline.len(),
            players = timeline.player_count(),
            delay = timeline.delay_frame_count(),
            "Loaded replay"
        );

        Ok(Self::new(Arc::new(timeline)))
    }

    /// Loads a `.krec` recording.
    pub fn open_krec(path: &Path) -> Result<Self, ReplayError> {
        Self::open(&KrecParser, path)
    }

    pub fn timeline(&self) -> &Arc<ReplayTimeline> {
        &self.timeline
    }

    /// Marks a frame boundary. Must be called once per rendered frame.
    pub fn reset_tick(&mut self) {
        self.state.reset_tick();
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Number of frames consumed so far.
    pub fn current_frame(&self) -> usize {
        self.state.current_frame_index()
    }

    pub fn total_frames(&self) -> usize {
        self.timeline.len()
    }

    /// Answers one controller poll.
    ///
    /// A controller read on channel 0 consumes the next recorded frame, at most once per
    /// tick. Every other read inside the same tick sees the cached frame. Once the
    /// timeline runs out nothing is written anymore.
    pub fn on_controller_poll(&mut self, channels: &mut [PifChannel<'_>]) {
        if self.state.is_finished() {
            return;
        }

        let wants_frame = channels.first().is_some_and(|channel| {
            channel.joybus_command() == Some(JoybusCommand::ControllerRead) && channel.response.is_some()
        });

        if wants_frame && !self.state.consumed_this_tick() && !self.state.advance(&self.timeline) {
            tracing::info!(
                target: Log::Replay,
                frames = self.state.current_frame_index(),
                "Replay finished"
            );

            return;
        }

        let player_count = self.timeline.player_count();
        let cached_players = self.state.cached_players();
        let cached = *self.state.cached_input();

        for (index, channel) in channels.iter_mut().enumerate().take(player_count) {
            let Some(command) = channel.joybus_command() else {
                continue;
            };

            let Some(status) = channel.status.as_deref_mut() else {
                continue;
            };

            *status &= !CHANNEL_ERROR_BITS;

            let Some(response) = channel.response.as_deref_mut() else {
                continue;
            };

            match command {
                JoybusCommand::Status | JoybusCommand::Reset => {
                    write_prefix(response, &STANDARD_CONTROLLER_STATUS);
                },

                JoybusCommand::ControllerRead => {
                    if index < cached_players {
                        write_prefix(response, &cached.players[index].to_be_bytes());
                    }
                },

                JoybusCommand::PakRead => {
                    if let Some(crc) = response.get_mut(32) {
                        *crc = NO_PAK;
                    }
                },

                JoybusCommand::PakWrite => {
                    write_prefix(response, &[NO_PAK]);
                },

                JoybusCommand::Other(_) => {},
            }
        }
    }
}

fn write_prefix(dest: &mut [u8], bytes: &[u8]) {
    let len = bytes.len().min(dest.len());
    dest[..len].copy_from_slice(&bytes[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MAX_PLAYERS;

    fn timeline(player_count: i32, frames: &[[u32; MAX_PLAYERS]]) -> Arc<ReplayTimeline> {
        let mut bytes = vec![0u8; 400];
        bytes[..4].copy_from_slice(b"KRC1");
        bytes[268..272].copy_from_slice(&player_count.to_le_bytes());

        for frame in frames {
            let payload: Vec<u8> = frame
                .iter()
                .take(player_count as usize)
                .flat_map(|word| word.to_le_bytes())
                .collect();

            bytes.push(0x12);
            bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            bytes.extend_from_slice(&payload);
        }

        Arc::new(KrecParser.parse_bytes(&bytes).unwrap())
    }

    struct Pif {
        status: [u8; 4],
        rx: [[u8; 33]; 4],
    }

    impl Pif {
        fn new() -> Self {
            Self {
                status: [0xFF; 4],
                rx: [[0; 33]; 4],
            }
        }

        fn poll(&mut self, sync: &mut ReplaySynchronizer, commands: [Option<u8>; 4]) {
            let mut channels: Vec<PifChannel<'_>> = self
                .status
                .iter_mut()
                .zip(self.rx.iter_mut())
                .zip(commands)
                .map(|((status, rx), command)| PifChannel {
                    command,
                    status: Some(status),
                    response: Some(&mut rx[..]),
                })
                .collect();

            sync.on_controller_poll(&mut channels);
        }
    }

    const READ_ALL: [Option<u8>; 4] = [Some(0x01); 4];

    #[test]
    fn repeated_polls_in_one_tick_consume_one_frame() {
        let mut sync = ReplaySynchronizer::new(timeline(2, &[[1, 2, 0, 0], [3, 4, 0, 0]]));
        let mut pif = Pif::new();

        for _ in 0..4 {
            pif.poll(&mut sync, READ_ALL);
        }

        assert_eq!(sync.current_frame(), 1);
        assert_eq!(&pif.rx[0][..4], &1u32.to_be_bytes());
        assert_eq!(&pif.rx[1][..4], &2u32.to_be_bytes());

        sync.reset_tick();
        pif.poll(&mut sync, READ_ALL);

        assert_eq!(sync.current_frame(), 2);
        assert_eq!(&pif.rx[0][..4], &3u32.to_be_bytes());
    }

    #[test]
    fn words_are_written_big_endian() {
        let mut sync = ReplaySynchronizer::new(timeline(1, &[[0x0080_1234, 0, 0, 0]]));
        let mut pif = Pif::new();

        pif.poll(&mut sync, READ_ALL);

        assert_eq!(&pif.rx[0][..4], &[0x00, 0x80, 0x12, 0x34]);
    }

    #[test]
    fn channels_past_the_player_count_are_untouched() {
        let mut sync = ReplaySynchronizer::new(timeline(2, &[[1, 2, 0, 0]]));
        let mut pif = Pif::new();

        pif.poll(&mut sync, READ_ALL);

        assert_eq!(pif.status, [0x3F, 0x3F, 0xFF, 0xFF]);
        assert_eq!(pif.rx[2], [0; 33]);
        assert_eq!(pif.rx[3], [0; 33]);
    }

    #[test]
    fn status_and_pak_commands_report_a_bare_controller() {
        let mut sync = ReplaySynchronizer::new(timeline(4, &[[1, 2, 3, 4]]));
        let mut pif = Pif::new();

        pif.poll(&mut sync, [Some(0x01), Some(0x00), Some(0x02), Some(0x03)]);

        assert_eq!(sync.total_frames(), 1);
        assert_eq!(sync.current_frame(), 1);
        assert_eq!(&pif.rx[0][..4], &1u32.to_be_bytes());
        assert_eq!(pif.status, [0x3F; 4]);
        assert_eq!(&pif.rx[1][..3], &STANDARD_CONTROLLER_STATUS);
        assert_eq!(pif.rx[2][32], NO_PAK);
        assert_eq!(pif.rx[3][0], NO_PAK);

        pif.poll(&mut sync, [Some(0xFF), None, None, None]);
        assert_eq!(&pif.rx[0][..3], &STANDARD_CONTROLLER_STATUS);
    }

    #[test]
    fn non_read_polls_do_not_advance() {
        let mut sync = ReplaySynchronizer::new(timeline(1, &[[1, 0, 0, 0]]));
        let mut pif = Pif::new();

        pif.poll(&mut sync, [Some(0x00), None, None, None]);
        sync.reset_tick();
        pif.poll(&mut sync, [Some(0x00), None, None, None]);

        assert_eq!(sync.current_frame(), 0);
        assert!(!sync.is_finished());
    }

    #[test]
    fn exhausted_timeline_finishes_and_stops_writing() {
        let mut sync = ReplaySynchronizer::new(timeline(1, &[[7, 0, 0, 0]]));
        let mut pif = Pif::new();

        pif.poll(&mut sync, READ_ALL);
        assert!(!sync.is_finished());

        sync.reset_tick();
        pif.rx = [[0xAA; 33]; 4];
        pif.poll(&mut sync, READ_ALL);

        assert!(sync.is_finished());
        assert_eq!(sync.current_frame(), 1);
        assert_eq!(pif.rx[0], [0xAA; 33]);

        sync.reset_tick();
        pif.poll(&mut sync, [Some(0x00), None, None, None]);
        assert_eq!(pif.rx[0], [0xAA; 33]);
    }
}
