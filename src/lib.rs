//! Core of the GameCube/Wii External Interface (EXI) bus driver.
//!
//! The EXI controller has three channels, each with up to three chip
//! selects. This crate arbitrates ownership of channels between device
//! drivers, moves data in immediate, interrupt-driven or DMA mode, and
//! dispatches device and insertion events from deferred context.
//!
//! Everything hardware-facing goes through [`Platform`].

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod bus;
pub mod channel;
pub mod command;
pub mod config;
pub mod device;
pub mod engine;
pub mod event;
mod irq;
pub mod platform;
pub mod raw;
pub mod regs;
pub mod status;
pub mod structs;

#[cfg(test)]
mod tests;

pub use bus::ExiBus;
pub use channel::{ChannelStatsSnapshot, Holder};
pub use command::{
    split_transfer, Command, CommandFlags, Completion, CompletionSignal, Continuation, Opcode,
    Split,
};
pub use config::{BusConfig, EXI_ID_INVALID, EXI_ID_NONE, NUM_CHANNELS};
pub use device::ExiDevice;
pub use engine::Dispatch;
pub use event::{event_fn, ChannelMask, EventHandler, EventId};
pub use platform::{Clock, DmaAddr, DmaDirection, Platform, Register};
pub use regs::{Frequency, TransferKind};
pub use status::{ExiError, ExiResult};
pub use structs::aligned_buffer::TransferBuf;
