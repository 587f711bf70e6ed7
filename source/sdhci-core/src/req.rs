//! SD/MMC request types.
//!
//! A [`Request`] describes one command to send to the card, optionally with
//! an associated data transfer. Requests are built by the card layer and
//! passed to [`Sdhci::request`](crate::Sdhci::request) by mutable reference;
//! the driver fills in [`Request::response`] and, for PIO reads, the data
//! buffer.

use crate::{
    platform::{DmaRegion, Pmt},
    Error,
};

/// The SD command index used for tuning (CMD19).
pub const SD_SEND_TUNING_BLOCK: u8 = 19;
/// The MMC command index used for HS200 tuning (CMD21).
pub const MMC_SEND_TUNING_BLOCK: u8 = 21;

/// The largest command index the 6-bit field can hold.
pub const MAX_COMMAND_INDEX: u8 = 63;

/// How the card responds to a command.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResponseType {
    /// No response.
    None,
    /// A 136-bit response (R2).
    Len136,
    /// A 48-bit response.
    Len48,
    /// A 48-bit response with a busy signal on DAT0 afterwards (R1b).
    Len48Busy,
}

/// The SDHCI command type.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CommandType {
    Normal,
    Suspend,
    Resume,
    /// Abort commands (CMD12, CMD52) may be issued while the data lines are
    /// busy, and the controller resets its CMD and DAT lines after one
    /// completes.
    Abort,
}

/// Automatic follow-up command issued by the controller after a data
/// transfer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AutoCmd {
    Disabled,
    /// CMD12 (STOP_TRANSMISSION) after the last block.
    Cmd12,
    /// CMD23 (SET_BLOCK_COUNT) before the transfer.
    Cmd23,
}

/// The direction of a data transfer, from the card's point of view.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    /// Card to host.
    Read,
    /// Host to card.
    Write,
}

/// The memory backing a data transfer.
#[derive(Debug)]
pub enum RequestBuffer<'buf> {
    /// Data is moved through the buffer data port register by the CPU.
    Pio(&'buf mut [u8]),
    /// Data is moved by the controller's ADMA2 engine.
    Dma(DmaRegion),
}

/// The data phase of a [`Request`].
#[derive(Debug)]
pub struct DataTransfer<'buf> {
    pub direction: Direction,
    /// Size of one block in bytes. For PIO this must be a multiple of 4.
    pub block_size: u16,
    /// Number of blocks to transfer.
    pub block_count: u16,
    pub auto_cmd: AutoCmd,
    pub buffer: RequestBuffer<'buf>,
}

impl DataTransfer<'_> {
    /// Returns `true` if more than one block is transferred.
    pub fn multi_block(&self) -> bool {
        self.block_count > 1
    }

    /// Total length of the transfer in bytes.
    pub fn len(&self) -> usize {
        usize::from(self.block_size) * usize::from(self.block_count)
    }

    /// Returns `true` if the transfer moves no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One command to execute on the bus.
#[derive(Debug)]
pub struct Request<'buf> {
    /// The command index (CMD0 through CMD63).
    pub index: u8,
    /// The 32-bit command argument.
    pub argument: u32,
    pub response_type: ResponseType,
    pub command_type: CommandType,
    /// Whether the controller should check the response CRC.
    pub crc_check: bool,
    /// Whether the controller should check the command index echoed in the
    /// response.
    pub index_check: bool,
    /// The data phase, if any.
    pub data: Option<DataTransfer<'buf>>,
    /// The card's response, filled in on completion. A 48-bit response
    /// occupies `response[0]`; a 136-bit response occupies all four words.
    pub response: [u32; 4],
    pub(crate) status: Option<Result<(), Error>>,
    pub(crate) pmt: Option<Pmt>,
}

impl<'buf> Request<'buf> {
    /// Returns a new request with no data phase.
    pub fn new(index: u8, argument: u32, response_type: ResponseType) -> Self {
        Self {
            index,
            argument,
            response_type,
            command_type: CommandType::Normal,
            crc_check: response_type != ResponseType::None,
            index_check: matches!(
                response_type,
                ResponseType::Len48 | ResponseType::Len48Busy
            ),
            data: None,
            response: [0; 4],
            status: None,
            pmt: None,
        }
    }

    /// Returns `self` with the given data phase.
    pub fn with_data(self, data: DataTransfer<'buf>) -> Self {
        Self {
            data: Some(data),
            ..self
        }
    }

    /// Returns `true` if the card holds DAT0 busy after responding.
    pub fn busy(&self) -> bool {
        self.response_type == ResponseType::Len48Busy
    }

    /// Returns `true` if this request has a data phase.
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub(crate) fn is_tuning(&self) -> bool {
        matches!(self.index, SD_SEND_TUNING_BLOCK | MMC_SEND_TUNING_BLOCK) && self.has_data()
    }
}
