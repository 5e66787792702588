use crate::config::{NUM_CHANNELS, SLOTS_PER_CHANNEL};
use crate::regs::Frequency;
use crate::status::{ExiError, ExiResult};

/// A peripheral as callers see it: a slot on a channel, clocked at a
/// given frequency. Two devices are the same owner iff all three match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExiDevice {
    channel: usize,
    slot: u8,
    frequency: Frequency,
}

impl ExiDevice {
    pub fn new(channel: usize, slot: u8, frequency: Frequency) -> ExiResult<Self> {
        if channel >= NUM_CHANNELS || slot >= SLOTS_PER_CHANNEL[channel] {
            return Err(ExiError::InvalidDevice);
        }
        Ok(Self {
            channel,
            slot,
            frequency,
        })
    }

    /// Like [`new`](Self::new) but taking the raw clock index.
    pub fn from_raw(channel: usize, slot: u8, frequency: u8) -> ExiResult<Self> {
        Self::new(channel, slot, Frequency::try_from(frequency)?)
    }

    #[inline]
    pub fn channel(&self) -> usize {
        self.channel
    }

    #[inline]
    pub fn slot(&self) -> u8 {
        self.slot
    }

    #[inline]
    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    /// Slot 0 of channels 0 and 1 are the memory card bays.
    pub fn is_memcard_slot(&self) -> bool {
        self.channel < 2 && self.slot == 0
    }
}
