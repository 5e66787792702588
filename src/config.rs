/// Number of EXI channels on the bus.
pub const NUM_CHANNELS: usize = 3;

/// Peripheral slots addressable on each channel.
pub const SLOTS_PER_CHANNEL: [u8; NUM_CHANNELS] = [3, 1, 1];

/// DMA address and length granularity.
pub const DMA_ALIGN: usize = 32;

/// Largest immediate-mode chunk (one DATA register).
pub const IMMEDIATE_MAX: usize = 4;

/// Returned by `get_id` when nothing answered.
pub const EXI_ID_INVALID: u32 = 0xffff_ffff;

/// Returned by `get_id` for an unidentified card in a memory card slot.
pub const EXI_ID_NONE: u32 = EXI_ID_INVALID - 1;

/// Runtime tunables for the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Bound for a single busy-wait immediate chunk.
    pub immediate_timeout_us: u64,
    /// Bound for `wait_dma`.
    pub dma_timeout_us: u64,
    /// Extra bytes moved by busy-wait in one interrupt-driven step.
    pub idi_balance: usize,
}

impl BusConfig {
    pub const fn new() -> Self {
        Self {
            immediate_timeout_us: 1_000,
            dma_timeout_us: 10_000,
            idi_balance: 16,
        }
    }

    pub const fn with_timeouts(mut self, immediate_us: u64, dma_us: u64) -> Self {
        self.immediate_timeout_us = immediate_us;
        self.dma_timeout_us = dma_us;
        self
    }

    pub const fn with_idi_balance(mut self, balance: usize) -> Self {
        self.idi_balance = balance;
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}
