/// The most controllers a recording (or the console) can carry.
pub const MAX_PLAYERS: usize = 4;

/// Bytes each player occupies in a single recorded frame.
pub const BYTES_PER_PLAYER: usize = 4;

/// Response to STATUS/RESET: a standard controller with no expansion pak.
pub const STANDARD_CONTROLLER_STATUS: [u8; 3] = [0x00, 0x05, 0x00];

/// Written into pak responses to report that no pak is present.
pub const NO_PAK: u8 = 0xFF;

/// Error bits in a channel's receive-status byte.
pub const CHANNEL_ERROR_BITS: u8 = 0xC0;

/// One emulated frame's worth of recorded controller state, one word per player.
///
/// Slots beyond the recording's player count are always zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputFrame {
    pub players: [u32; MAX_PLAYERS],
}

impl InputFrame {
    pub fn is_empty(&self) -> bool {
        self.players.iter().all(|word| *word == 0)
    }
}

/// Commands the core can place on a joybus channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoybusCommand {
    Status,
    ControllerRead,
    PakRead,
    PakWrite,
    Reset,
    Other(u8),
}

impl From<u8> for JoybusCommand {
    fn from(byte: u8) -> Self {
        match byte {
            0x00 => JoybusCommand::Status,
            0x01 => JoybusCommand::ControllerRead,
            0x02 => JoybusCommand::PakRead,
            0x03 => JoybusCommand::PakWrite,
            0xFF => JoybusCommand::Reset,
            other => JoybusCommand::Other(other),
        }
    }
}

impl JoybusCommand {
    /// How many response bytes the command expects. Hosts that hand over raw
    /// pointers use this to size the response slice.
    pub fn response_len(self) -> usize {
        match self {
            JoybusCommand::Status | JoybusCommand::Reset => 3,
            JoybusCommand::ControllerRead => 4,
            JoybusCommand::PakRead => 33,
            JoybusCommand::PakWrite => 1,
            JoybusCommand::Other(_) => 0,
        }
    }
}

/// A view over one joybus channel of the PIF, as handed over by the core on each
/// controller poll.
#[derive(Debug, Default)]
pub struct PifChannel<'a> {
    /// First byte of the transmit buffer, or `None` if the channel is idle.
    pub command: Option<u8>,

    /// The channel's receive-status byte.
    pub status: Option<&'a mut u8>,

    /// The response buffer.
    pub response: Option<&'a mut [u8]>,
}

impl PifChannel<'_> {
    pub fn joybus_command(&self) -> Option<JoybusCommand> {
        self.command.map(JoybusCommand::from)
    }
}
