use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use crate::config::DMA_ALIGN;

#[repr(C, align(32))]
#[derive(Clone, Copy)]
struct DmaLine([u8; DMA_ALIGN]);

/// Heap buffer for EXI transfers.
///
/// Backing storage is always 32-byte aligned; the visible window starts
/// `misalignment` bytes into it so callers can place data anywhere
/// relative to a DMA line. The heap address never moves while the
/// buffer is alive, so a command can keep it mapped across an interrupt.
pub struct TransferBuf {
    lines: Vec<DmaLine>,
    start: usize,
    len: usize,
}

impl TransferBuf {
    pub fn zeroed(len: usize) -> Self {
        Self::with_offset(len, 0)
    }

    /// Zeroed buffer whose first byte sits `misalignment % 32` bytes
    /// past a DMA boundary.
    pub fn with_offset(len: usize, misalignment: usize) -> Self {
        let start = misalignment % DMA_ALIGN;
        let lines = (start + len).div_ceil(DMA_ALIGN);
        Self {
            lines: vec![DmaLine([0; DMA_ALIGN]); lines],
            start,
            len,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_slice_at(data, 0)
    }

    pub fn from_slice_at(data: &[u8], misalignment: usize) -> Self {
        let mut buf = Self::with_offset(data.len(), misalignment);
        buf.as_mut_slice().copy_from_slice(data);
        buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first visible byte.
    #[inline]
    pub fn addr(&self) -> usize {
        self.backing().as_ptr() as usize + self.start
    }

    #[inline]
    pub fn misalignment(&self) -> usize {
        self.addr() % DMA_ALIGN
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.backing()[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let (start, len) = (self.start, self.len);
        &mut self.backing_mut()[start..start + len]
    }

    /// Mutable view of `range`, relative to the visible window.
    pub fn range_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        &mut self.as_mut_slice()[range]
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    fn backing(&self) -> &[u8] {
        // SAFETY: DmaLine is a repr(C) byte array with no padding.
        unsafe {
            core::slice::from_raw_parts(
                self.lines.as_ptr() as *const u8,
                self.lines.len() * DMA_ALIGN,
            )
        }
    }

    fn backing_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; the borrow of `self` is exclusive.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.lines.as_mut_ptr() as *mut u8,
                self.lines.len() * DMA_ALIGN,
            )
        }
    }
}

impl core::fmt::Debug for TransferBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransferBuf")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}
