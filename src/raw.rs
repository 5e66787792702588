//! Register-level transfer primitives.
//!
//! Everything here runs with at most the channel's register lock held,
//! and only for one read-modify-write at a time, with the interrupt held
//! off while it is. Waits are busy-waits
//! bounded by the configured timeouts.

use log::{error, trace};
use spin::Mutex;

use crate::channel::ChannelStats;
use crate::config::{BusConfig, DMA_ALIGN, IMMEDIATE_MAX};
use crate::platform::{DmaAddr, Platform, Register};
use crate::regs::{pack_data, unpack_data, Cr, Csr, Frequency, IrqSources, TransferKind};
use crate::status::{ExiError, ExiResult};
use crate::structs::deadline::Deadline;

/// A DMA window that is known to satisfy the controller's alignment rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    addr: DmaAddr,
    len: usize,
}

impl DmaRegion {
    pub fn new(addr: DmaAddr, len: usize) -> ExiResult<Self> {
        if len == 0 || addr.0 as usize % DMA_ALIGN != 0 || len % DMA_ALIGN != 0 {
            return Err(ExiError::Misaligned);
        }
        Ok(Self { addr, len })
    }

    #[inline]
    pub fn addr(&self) -> DmaAddr {
        self.addr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
}

/// Borrowed view of one channel's registers.
pub(crate) struct RawChannel<'a, P: Platform> {
    pub(crate) platform: &'a P,
    pub(crate) index: usize,
    pub(crate) io_lock: &'a Mutex<()>,
    pub(crate) stats: &'a ChannelStats,
    pub(crate) config: &'a BusConfig,
}

impl<'a, P: Platform> RawChannel<'a, P> {
    #[inline]
    pub(crate) fn csr(&self) -> Csr {
        Csr::from_raw(self.platform.read_reg(self.index, Register::Csr))
    }

    #[inline]
    fn cr(&self) -> Cr {
        Cr::from_bits_retain(self.platform.read_reg(self.index, Register::Cr))
    }

    /// CSR read-modify-write under the register lock. `f` sees the live
    /// value and returns what to write; status bits it leaves set get acked.
    fn update_csr<F: FnOnce(Csr) -> Csr>(&self, f: F) -> Csr {
        self.platform.without_interrupts(|| {
            let _io = self.io_lock.lock();
            let csr = self.csr();
            self.platform
                .write_reg(self.index, Register::Csr, f(csr).bits());
            csr
        })
    }

    pub(crate) fn select(&self, slot: u8, freq: Frequency) {
        self.update_csr(|csr| csr.with_select(slot, freq));
    }

    pub(crate) fn deselect(&self) {
        self.update_csr(|csr| csr.deselected());
    }

    pub(crate) fn enable_irqs(&self, sources: IrqSources) {
        self.update_csr(|csr| (csr - Csr::INT_STATUS) | sources.mask_bits());
    }

    pub(crate) fn disable_irqs(&self, sources: IrqSources) {
        self.update_csr(|csr| csr - Csr::INT_STATUS - sources.mask_bits());
    }

    pub(crate) fn ack(&self, sources: IrqSources) {
        self.update_csr(|csr| (csr - Csr::INT_STATUS) | sources.status_bits());
    }

    /// Ack and mask `sources` in one write.
    pub(crate) fn mask_and_ack(&self, sources: IrqSources) {
        self.update_csr(|csr| {
            (csr - Csr::INT_STATUS - sources.mask_bits()) | sources.status_bits()
        });
    }

    /// Ack every latched, unmasked source. Returns those sources and the
    /// CSR as it was read.
    pub(crate) fn take_pending(&self) -> (IrqSources, Csr) {
        self.platform.without_interrupts(|| {
            let _io = self.io_lock.lock();
            let csr = self.csr();
            let pending = IrqSources::pending(csr);
            if !pending.is_empty() {
                self.platform.write_reg(
                    self.index,
                    Register::Csr,
                    ((csr - Csr::INT_STATUS) | pending.status_bits()).bits(),
                );
            }
            (pending, csr)
        })
    }

    /// Deselect, mask every source and ack everything latched.
    pub(crate) fn quiesce(&self) {
        self.update_csr(|csr| (csr & Csr::ROMDIS) | Csr::INT_STATUS);
    }

    /// Kick one immediate chunk without waiting for it.
    pub(crate) fn start_immediate(&self, chunk: &[u8], kind: TransferKind) {
        debug_assert!(!chunk.is_empty() && chunk.len() <= IMMEDIATE_MAX);
        if kind.writes() {
            self.platform
                .write_reg(self.index, Register::Data, pack_data(chunk));
        }
        self.platform.write_reg(
            self.index,
            Register::Cr,
            Cr::immediate(chunk.len(), kind).bits(),
        );
        ChannelStats::bump(&self.stats.immediate_chunks);
    }

    /// Collect what a finished immediate chunk clocked in.
    pub(crate) fn finish_immediate(&self, chunk: &mut [u8], kind: TransferKind) {
        if kind.reads() {
            let data = self.platform.read_reg(self.index, Register::Data);
            unpack_data(data, chunk);
        }
    }

    fn wait_idle(&self, timeout_us: u64) -> bool {
        let dl = Deadline::after(self.platform, timeout_us);
        dl.spin_until(self.platform, || !self.cr().busy())
    }

    /// Busy-wait transfer of `buf` through the DATA register, four bytes
    /// at a time and then the ≤3-byte tail.
    pub(crate) fn transfer_immediate(&self, buf: &mut [u8], kind: TransferKind) -> ExiResult {
        for chunk in buf.chunks_mut(IMMEDIATE_MAX) {
            self.start_immediate(chunk, kind);
            if !self.wait_idle(self.config.immediate_timeout_us) {
                error!(
                    "exi{}: immediate {} of {} bytes timed out",
                    self.index,
                    kind,
                    chunk.len()
                );
                return Err(ExiError::Timeout);
            }
            self.finish_immediate(chunk, kind);
            self.ack(IrqSources::TRANSFER_COMPLETE);
        }
        Ok(())
    }

    pub(crate) fn start_dma(&self, region: DmaRegion, kind: TransferKind) {
        trace!(
            "exi{}: dma {} {:#010x}+{}",
            self.index,
            kind,
            region.addr().0,
            region.len()
        );
        self.platform
            .write_reg(self.index, Register::Mar, region.addr().0);
        self.platform
            .write_reg(self.index, Register::Length, region.len() as u32);
        self.enable_irqs(IrqSources::TRANSFER_COMPLETE);
        self.platform
            .write_reg(self.index, Register::Cr, Cr::dma(kind).bits());
        ChannelStats::bump(&self.stats.dma_transfers);
    }

    /// Poll for the running transfer to finish with the completion
    /// interrupt masked. On timeout the hardware is left as it is.
    pub(crate) fn wait_dma(&self) -> ExiResult {
        self.disable_irqs(IrqSources::TRANSFER_COMPLETE);
        let result = if self.wait_idle(self.config.dma_timeout_us) {
            Ok(())
        } else {
            error!(
                "exi{}: transfer still running after {}us, giving up",
                self.index, self.config.dma_timeout_us
            );
            Err(ExiError::Timeout)
        };
        self.update_csr(|csr| (csr - Csr::INT_STATUS) | Csr::TCINT_MASK | Csr::TCINT);
        result
    }
}
