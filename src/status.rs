use strum::Display;

/// Error codes returned by the EXI core.
///
/// Synchronous operations return these directly; transfers carry them in
/// their [`Completion`](crate::command::Completion).
#[repr(i32)]
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExiError {
    /// Channel already owned, in-flight command present, or event slot taken.
    Busy = -16,
    /// Opcode outside the known set, or an operation the target cannot do.
    Unsupported = -95,
    /// Hardware did not clear the transfer start bit in time.
    Timeout = -110,
    /// Transfer interrupted by device extraction.
    Break = -32,
    /// DMA address or length not on a 32-byte boundary.
    Misaligned = -22,
    /// Give from a device that does not hold the channel.
    NotOwner = -1,
    /// No handler in the addressed event slot.
    NotRegistered = -2,
    /// Channel, slot or frequency out of range.
    InvalidDevice = -19,
}

impl ExiError {
    /// Negative errno-style code, for callers that surface integers.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }
}

pub type ExiResult<T = ()> = Result<T, ExiError>;
