//! Services the EXI core consumes from the surrounding kernel.
//!
//! The core never touches memory-mapped I/O, DMA mappings, or the
//! interrupt controller directly. An embedding provides one [`Platform`]
//! value and wires its shared-IRQ handler to
//! [`ExiBus::handle_irq`](crate::bus::ExiBus::handle_irq) and its
//! deferred-work hook to
//! [`ExiBus::run_deferred`](crate::bus::ExiBus::run_deferred).

use strum::Display;

/// Registers in one channel's block, in hardware order.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    /// Channel parameter register: chip select, clock, interrupt masks/status.
    Csr,
    /// DMA memory address.
    Mar,
    /// DMA length.
    Length,
    /// Control register: start, DMA, direction, immediate length.
    Cr,
    /// Immediate data.
    Data,
}

impl Register {
    /// Stride between channel blocks.
    pub const CHANNEL_STRIDE: usize = 0x14;

    /// Byte offset within a channel block.
    pub const fn offset(self) -> usize {
        match self {
            Register::Csr => 0x00,
            Register::Mar => 0x04,
            Register::Length => 0x08,
            Register::Cr => 0x0c,
            Register::Data => 0x10,
        }
    }
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Memory is written by the device.
    FromDevice,
    /// Memory is read by the device.
    ToDevice,
}

/// Bus address handed back by [`Platform::dma_map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DmaAddr(pub u32);

/// Monotonic time source used for every bounded busy-wait.
pub trait Clock {
    fn now_micros(&self) -> u64;

    /// Called between polls of a busy-wait.
    #[inline]
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

pub trait Platform: Clock + Send + Sync {
    /// 32-bit register read. Byte order is the platform's business.
    fn read_reg(&self, channel: usize, reg: Register) -> u32;

    fn write_reg(&self, channel: usize, reg: Register, value: u32);

    /// Map `buf` for a device transfer. The returned address must keep
    /// the low five bits of the buffer's address.
    fn dma_map(&self, buf: &mut [u8], dir: DmaDirection) -> DmaAddr;

    fn dma_unmap(&self, addr: DmaAddr, len: usize, dir: DmaDirection);

    /// Request that `run_deferred(channel)` be called from deferred context.
    fn schedule_deferred(&self, channel: usize);

    /// Hook the shared EXI interrupt line.
    fn enable_irq(&self) {}

    /// True when the caller cannot sleep; synchronous transfers then poll.
    fn in_atomic(&self) -> bool {
        false
    }

    /// Run `f` with the EXI interrupt held off on the calling CPU and
    /// restore the previous state afterwards. Must nest.
    ///
    /// Every channel lock taken outside the top half is taken inside this,
    /// so the top half never spins on a lock its own CPU holds.
    fn without_interrupts<R, F: FnOnce() -> R>(&self, f: F) -> R;

    /// Give up the CPU while waiting for a completion.
    fn idle(&self) {
        self.relax();
    }

    /// Suspend until `ready` holds. `ready` is rechecked after every
    /// [`wake`](Self::wake) of `channel`; a wake between the check and
    /// the sleep must not be lost.
    fn wait_until(&self, _channel: usize, ready: &mut dyn FnMut() -> bool) {
        while !ready() {
            self.idle();
        }
    }

    /// Wake everything suspended in [`wait_until`](Self::wait_until) on
    /// `channel`.
    fn wake(&self, _channel: usize) {}
}
