use proptest::prelude::*;

use exi::command::split_transfer;
use exi::config::DMA_ALIGN;
use exi::regs::{Csr, Frequency};
use exi::TransferBuf;

fn frequency() -> impl Strategy<Value = Frequency> {
    (0u8..6).prop_map(|v| Frequency::try_from(v).unwrap())
}

proptest! {
    #[test]
    fn split_covers_buffer(addr in 0usize..0x1_0000, len in 0usize..4096) {
        let s = split_transfer(addr, len);
        prop_assert_eq!(s.pre + s.body + s.post, len);
        prop_assert!(s.pre < DMA_ALIGN);
        prop_assert!(s.post < DMA_ALIGN);
        prop_assert_eq!(s.body % DMA_ALIGN, 0);
        if s.body > 0 {
            prop_assert_eq!((addr + s.pre) % DMA_ALIGN, 0);
        }
    }

    #[test]
    fn split_of_real_buffer_is_dma_ready(mis in 0usize..32, len in 1usize..300) {
        let mut buf = TransferBuf::with_offset(len, mis);
        let s = split_transfer(buf.addr(), len);
        prop_assume!(s.body > 0);
        let body = buf.range_mut(s.body_range());
        prop_assert_eq!(body.as_ptr() as usize % DMA_ALIGN, 0);
    }

    #[test]
    fn select_keeps_masks_and_romdis(raw in any::<u32>(), slot in 0u8..3, freq in frequency()) {
        let before = Csr::from_raw(raw);
        let after = before.with_select(slot, freq);
        prop_assert_eq!(after & (Csr::INT_MASKS | Csr::ROMDIS), before & (Csr::INT_MASKS | Csr::ROMDIS));
        prop_assert_eq!(after.selected_slot(), Some(slot));
        prop_assert_eq!(after.clock_field(), freq as u32);
        prop_assert!((after & Csr::INT_STATUS).is_empty());
    }

    #[test]
    fn deselect_is_idempotent(raw in any::<u32>()) {
        let once = Csr::from_raw(raw).deselected();
        prop_assert_eq!(once.deselected(), once);
        prop_assert_eq!(once.selected_slot(), None);
    }
}
