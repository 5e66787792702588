//! EXI register encodings.
//!
//! CSR layout (per channel):
//!
//! | bits  | field        |
//! |-------|--------------|
//! | 0     | EXI int mask |
//! | 1     | EXI int      |
//! | 2     | TC int mask  |
//! | 3     | TC int       |
//! | 4..7  | clock        |
//! | 7..10 | chip select  |
//! | 10    | EXT int mask |
//! | 11    | EXT int      |
//! | 12    | EXT (device present) |
//! | 13    | ROM disable  |
//!
//! Status bits are write-one-to-clear, so every read-modify-write must
//! drop them unless it means to acknowledge.

use bitflags::bitflags;
use strum::{Display, EnumIter};

use crate::status::ExiError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Csr: u32 {
        const EXIINT_MASK = 1 << 0;
        const EXIINT      = 1 << 1;
        const TCINT_MASK  = 1 << 2;
        const TCINT       = 1 << 3;
        const CLK         = 0b111 << 4;
        const CS          = 0b111 << 7;
        const EXTINT_MASK = 1 << 10;
        const EXTINT      = 1 << 11;
        const EXT         = 1 << 12;
        const ROMDIS      = 1 << 13;

        const INT_MASKS  = Self::EXIINT_MASK.bits() | Self::TCINT_MASK.bits() | Self::EXTINT_MASK.bits();
        const INT_STATUS = Self::EXIINT.bits() | Self::TCINT.bits() | Self::EXTINT.bits();
    }
}

const CLK_SHIFT: u32 = 4;
const CS_SHIFT: u32 = 7;

impl Csr {
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Csr::from_bits_retain(raw)
    }

    /// Bits a select/deselect must carry over: interrupt masks and ROM disable.
    #[inline]
    pub fn preserved(self) -> Csr {
        self & (Csr::INT_MASKS | Csr::ROMDIS)
    }

    pub fn with_select(self, slot: u8, freq: Frequency) -> Csr {
        self.preserved()
            | Csr::from_bits_retain((1u32 << (CS_SHIFT + slot as u32)) & Csr::CS.bits())
            | Csr::from_bits_retain(((freq as u32) << CLK_SHIFT) & Csr::CLK.bits())
    }

    pub fn deselected(self) -> Csr {
        self.preserved() | (self & Csr::CLK)
    }

    pub fn clock_field(self) -> u32 {
        (self & Csr::CLK).bits() >> CLK_SHIFT
    }

    /// Index of the selected slot, if exactly one chip select is asserted.
    pub fn selected_slot(self) -> Option<u8> {
        let cs = (self & Csr::CS).bits() >> CS_SHIFT;
        if cs.count_ones() == 1 {
            Some(cs.trailing_zeros() as u8)
        } else {
            None
        }
    }

    pub fn device_present(self) -> bool {
        self.contains(Csr::EXT)
    }
}

bitflags! {
    /// The three interrupt sources of a channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrqSources: u8 {
        const TRANSFER_COMPLETE = 1 << 0;
        const DEVICE            = 1 << 1;
        const EXTERNAL          = 1 << 2;
    }
}

impl IrqSources {
    pub fn mask_bits(self) -> Csr {
        let mut csr = Csr::empty();
        if self.contains(IrqSources::TRANSFER_COMPLETE) {
            csr |= Csr::TCINT_MASK;
        }
        if self.contains(IrqSources::DEVICE) {
            csr |= Csr::EXIINT_MASK;
        }
        if self.contains(IrqSources::EXTERNAL) {
            csr |= Csr::EXTINT_MASK;
        }
        csr
    }

    pub fn status_bits(self) -> Csr {
        let mut csr = Csr::empty();
        if self.contains(IrqSources::TRANSFER_COMPLETE) {
            csr |= Csr::TCINT;
        }
        if self.contains(IrqSources::DEVICE) {
            csr |= Csr::EXIINT;
        }
        if self.contains(IrqSources::EXTERNAL) {
            csr |= Csr::EXTINT;
        }
        csr
    }

    /// Sources whose status is latched in `csr`.
    pub fn raised(csr: Csr) -> Self {
        let mut s = IrqSources::empty();
        s.set(IrqSources::TRANSFER_COMPLETE, csr.contains(Csr::TCINT));
        s.set(IrqSources::DEVICE, csr.contains(Csr::EXIINT));
        s.set(IrqSources::EXTERNAL, csr.contains(Csr::EXTINT));
        s
    }

    /// Sources whose mask bit is set in `csr`.
    pub fn enabled(csr: Csr) -> Self {
        let mut s = IrqSources::empty();
        s.set(IrqSources::TRANSFER_COMPLETE, csr.contains(Csr::TCINT_MASK));
        s.set(IrqSources::DEVICE, csr.contains(Csr::EXIINT_MASK));
        s.set(IrqSources::EXTERNAL, csr.contains(Csr::EXTINT_MASK));
        s
    }

    /// Latched and unmasked: what the top half has to service.
    pub fn pending(csr: Csr) -> Self {
        Self::raised(csr) & Self::enabled(csr)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr: u32 {
        const TSTART = 1 << 0;
        const DMA    = 1 << 1;
        const RW     = 0b11 << 2;
        const TLEN   = 0b11 << 4;
    }
}

const RW_SHIFT: u32 = 2;
const TLEN_SHIFT: u32 = 4;

impl Cr {
    /// Start an immediate transfer of `len` (1..=4) bytes.
    pub fn immediate(len: usize, kind: TransferKind) -> Cr {
        debug_assert!((1..=4).contains(&len));
        Cr::TSTART
            | Cr::from_bits_retain((kind as u32) << RW_SHIFT)
            | Cr::from_bits_retain((((len - 1) as u32) << TLEN_SHIFT) & Cr::TLEN.bits())
    }

    pub fn dma(kind: TransferKind) -> Cr {
        Cr::TSTART | Cr::DMA | Cr::from_bits_retain((kind as u32) << RW_SHIFT)
    }

    pub fn busy(self) -> bool {
        self.contains(Cr::TSTART)
    }

    pub fn immediate_len(self) -> usize {
        (((self & Cr::TLEN).bits() >> TLEN_SHIFT) + 1) as usize
    }

    pub fn kind(self) -> Option<TransferKind> {
        TransferKind::from_bits((self & Cr::RW).bits() >> RW_SHIFT)
    }
}

/// Data direction of a transfer, as encoded in CR.
#[repr(u32)]
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Read = 0,
    Write = 1,
    ReadWrite = 2,
}

impl TransferKind {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(TransferKind::Read),
            1 => Some(TransferKind::Write),
            2 => Some(TransferKind::ReadWrite),
            _ => None,
        }
    }

    pub fn reads(self) -> bool {
        matches!(self, TransferKind::Read | TransferKind::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, TransferKind::Write | TransferKind::ReadWrite)
    }
}

/// EXI clock selection.
#[repr(u8)]
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter)]
pub enum Frequency {
    Mhz1 = 0,
    Mhz2 = 1,
    Mhz4 = 2,
    Mhz8 = 3,
    Mhz16 = 4,
    Mhz32 = 5,
}

impl TryFrom<u8> for Frequency {
    type Error = ExiError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Frequency::Mhz1,
            1 => Frequency::Mhz2,
            2 => Frequency::Mhz4,
            3 => Frequency::Mhz8,
            4 => Frequency::Mhz16,
            5 => Frequency::Mhz32,
            _ => return Err(ExiError::InvalidDevice),
        })
    }
}

/// Pack up to four bytes big-endian into a DATA register value.
pub fn pack_data(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word[..bytes.len()].copy_from_slice(bytes);
    u32::from_be_bytes(word)
}

/// Unpack the leading `out.len()` bytes of a DATA register value.
pub fn unpack_data(value: u32, out: &mut [u8]) {
    let word = value.to_be_bytes();
    let n = out.len();
    out.copy_from_slice(&word[..n]);
}
