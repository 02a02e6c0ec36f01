use crate::parser::ReplayTimeline;
use crate::types::InputFrame;

/// Mutable playback cursor over a `ReplayTimeline`.
#[derive(Debug, Default)]
pub struct ReplayState {
    current_frame_index: usize,
    consumed_this_tick: bool,
    cached_input: InputFrame,
    cached_players: usize,
    finished: bool,
}

impl ReplayState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Called at every frame boundary so the next poll consumes a new frame.
    pub fn reset_tick(&mut self) {
        self.consumed_this_tick = false;
    }

    pub fn consumed_this_tick(&self) -> bool {
        self.consumed_this_tick
    }

    pub fn current_frame_index(&self) -> usize {
        self.current_frame_index
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn cached_input(&self) -> &InputFrame {
        &self.cached_input
    }

    pub fn cached_players(&self) -> usize {
        self.cached_players
    }

    /// Consumes the next frame into the cache. Returns `false` and marks playback as
    /// finished once the timeline is exhausted, which also clears the cache.
    pub fn advance(&mut self, timeline: &ReplayTimeline) -> bool {
        if self.finished {
            return false;
        }

        match timeline.frame(self.current_frame_index) {
            Some(frame) => {
                self.cached_input = *frame;
                self.cached_players = timeline.player_count();
                self.current_frame_index += 1;
                self.consumed_this_tick = true;
                true
            },

            None => {
                self.finished = true;
                self.cached_input = InputFrame::default();
                self.cached_players = 0;
                false
            },
        }
    }
}
