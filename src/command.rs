//! Command descriptors and their completion plumbing.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use spin::Mutex;
use strum::Display;

use crate::config::{DMA_ALIGN, NUM_CHANNELS};
use crate::device::ExiDevice;
use crate::platform::DmaAddr;
use crate::regs::TransferKind;
use crate::status::{ExiError, ExiResult};
use crate::structs::aligned_buffer::TransferBuf;

#[repr(u8)]
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Nop = 0,
    Take = 1,
    Give = 2,
    Select = 3,
    Deselect = 4,
    Read = 5,
    Write = 6,
    ReadWrite = 7,
}

impl Opcode {
    pub fn transfer_kind(self) -> Option<TransferKind> {
        match self {
            Opcode::Read => Some(TransferKind::Read),
            Opcode::Write => Some(TransferKind::Write),
            Opcode::ReadWrite => Some(TransferKind::ReadWrite),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ExiError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Opcode::Nop,
            1 => Opcode::Take,
            2 => Opcode::Give,
            3 => Opcode::Select,
            4 => Opcode::Deselect,
            5 => Opcode::Read,
            6 => Opcode::Write,
            7 => Opcode::ReadWrite,
            _ => return Err(ExiError::Unsupported),
        })
    }
}

impl From<TransferKind> for Opcode {
    fn from(kind: TransferKind) -> Self {
        match kind {
            TransferKind::Read => Opcode::Read,
            TransferKind::Write => Opcode::Write,
            TransferKind::ReadWrite => Opcode::ReadWrite,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandFlags: u8 {
        /// Take fails with `Busy` instead of waiting.
        const NOWAIT = 1 << 0;
        /// Never use DMA, even for large aligned buffers.
        const NODMA  = 1 << 1;
        /// Interrupt-driven immediate mode.
        const IDI    = 1 << 2;
    }
}

/// What a finished command hands back.
#[derive(Debug)]
pub struct Completion {
    pub opcode: Opcode,
    pub channel: usize,
    pub result: ExiResult,
    /// The command's buffer; holds received bytes after a read.
    pub data: TransferBuf,
}

/// One-shot slot a synchronous caller waits on.
#[derive(Default)]
pub struct CompletionSignal {
    done: AtomicBool,
    slot: Mutex<Option<Completion>>,
}

impl CompletionSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn post(&self, completion: Completion) {
        *self.slot.lock() = Some(completion);
        self.done.store(true, Ordering::Release);
    }

    pub fn take(&self) -> Option<Completion> {
        if !self.is_done() {
            return None;
        }
        self.slot.lock().take()
    }

    /// Wait until posted, calling `idle` between checks. Only one waiter
    /// may use a signal.
    pub fn wait<F: FnMut()>(&self, mut idle: F) -> Completion {
        loop {
            if self.is_done() {
                if let Some(completion) = self.slot.lock().take() {
                    return completion;
                }
            }
            idle();
        }
    }
}

/// How a command reports completion. Fired exactly once per command.
pub enum Continuation {
    /// Nobody is listening.
    Detached,
    Callback(Box<dyn FnOnce(Completion) + Send>),
    Signal(Arc<CompletionSignal>),
}

impl Continuation {
    pub(crate) fn fire(self, completion: Completion) {
        match self {
            Continuation::Detached => {}
            Continuation::Callback(f) => f(completion),
            Continuation::Signal(sig) => sig.post(completion),
        }
    }
}

impl core::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Continuation::Detached => f.write_str("Detached"),
            Continuation::Callback(_) => f.write_str("Callback"),
            Continuation::Signal(_) => f.write_str("Signal"),
        }
    }
}

/// One logical bus operation.
#[derive(Debug)]
pub struct Command {
    pub(crate) opcode: Opcode,
    pub(crate) flags: CommandFlags,
    pub(crate) channel: usize,
    pub(crate) device: Option<ExiDevice>,
    pub(crate) data: TransferBuf,
    /// Bytes still to move in an interrupt-driven transfer.
    pub(crate) bytes_left: usize,
    pub(crate) dma: Option<(DmaAddr, usize)>,
    pub(crate) continuation: Continuation,
}

impl Command {
    fn new(opcode: Opcode, channel: usize, device: Option<ExiDevice>) -> Self {
        Self {
            opcode,
            flags: CommandFlags::empty(),
            channel,
            device,
            data: TransferBuf::zeroed(0),
            bytes_left: 0,
            dma: None,
            continuation: Continuation::Detached,
        }
    }

    pub fn nop(channel: usize) -> ExiResult<Self> {
        check_channel(channel)?;
        Ok(Self::new(Opcode::Nop, channel, None))
    }

    pub fn take(device: ExiDevice, flags: CommandFlags) -> Self {
        Self::new(Opcode::Take, device.channel(), Some(device)).with_flags(flags)
    }

    pub fn give(device: ExiDevice) -> Self {
        Self::new(Opcode::Give, device.channel(), Some(device))
    }

    pub fn select(device: ExiDevice) -> Self {
        Self::new(Opcode::Select, device.channel(), Some(device))
    }

    pub fn deselect(channel: usize) -> ExiResult<Self> {
        check_channel(channel)?;
        Ok(Self::new(Opcode::Deselect, channel, None))
    }

    /// Build a read, write, or read-write over `data`.
    pub fn transfer(
        channel: usize,
        opcode: Opcode,
        data: TransferBuf,
        flags: CommandFlags,
    ) -> ExiResult<Self> {
        check_channel(channel)?;
        if opcode.transfer_kind().is_none() {
            return Err(ExiError::Unsupported);
        }
        let mut cmd = Self::new(opcode, channel, None).with_flags(flags);
        cmd.data = data;
        Ok(cmd)
    }

    pub fn read(channel: usize, len: usize) -> ExiResult<Self> {
        Self::transfer(channel, Opcode::Read, TransferBuf::zeroed(len), CommandFlags::empty())
    }

    pub fn write(channel: usize, bytes: &[u8]) -> ExiResult<Self> {
        Self::transfer(
            channel,
            Opcode::Write,
            TransferBuf::from_slice(bytes),
            CommandFlags::empty(),
        )
    }

    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_continuation(mut self, continuation: Continuation) -> Self {
        self.continuation = continuation;
        self
    }

    pub fn on_complete<F>(self, f: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.with_continuation(Continuation::Callback(Box::new(f)))
    }

    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    #[inline]
    pub fn channel(&self) -> usize {
        self.channel
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fire the continuation. Consumes the command so it cannot fire twice.
    pub(crate) fn complete(self, result: ExiResult) {
        let completion = Completion {
            opcode: self.opcode,
            channel: self.channel,
            result,
            data: self.data,
        };
        self.continuation.fire(completion);
    }
}

fn check_channel(channel: usize) -> ExiResult {
    if channel < NUM_CHANNELS {
        Ok(())
    } else {
        Err(ExiError::InvalidDevice)
    }
}

/// A transfer cut at DMA line boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    /// Unaligned head moved by immediate mode.
    pub pre: usize,
    /// Aligned middle moved by DMA.
    pub body: usize,
    /// Unaligned tail moved by immediate mode after the DMA.
    pub post: usize,
}

impl Split {
    pub fn pre_range(&self) -> Range<usize> {
        0..self.pre
    }

    pub fn body_range(&self) -> Range<usize> {
        self.pre..self.pre + self.body
    }

    pub fn post_range(&self) -> Range<usize> {
        self.pre + self.body..self.pre + self.body + self.post
    }
}

/// Split `len` bytes starting at `addr` into head, DMA body and tail.
pub fn split_transfer(addr: usize, len: usize) -> Split {
    let to_boundary = (DMA_ALIGN - addr % DMA_ALIGN) % DMA_ALIGN;
    let pre = to_boundary.min(len);
    let rest = len - pre;
    let body = rest & !(DMA_ALIGN - 1);
    Split {
        pre,
        body,
        post: rest - body,
    }
}
