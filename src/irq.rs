//! Top half: runs in interrupt context on the shared EXI line.
//!
//! Acks whatever fired, finishes transfers, and latches events for the
//! deferred pass. Never calls an event handler directly.

use core::sync::atomic::Ordering;

use log::{debug, trace};

use crate::bus::ExiBus;
use crate::config::NUM_CHANNELS;
use crate::event::EventId;
use crate::platform::Platform;
use crate::regs::IrqSources;
use crate::status::ExiError;

impl<P: Platform> ExiBus<P> {
    /// Service every channel. Returns `false` if nothing on the bus was
    /// asserting the line, so a shared handler can pass it on.
    pub fn handle_irq(&self) -> bool {
        let mut handled = false;
        for ch in 0..NUM_CHANNELS {
            let (sources, csr) = self.raw(ch).take_pending();
            if sources.is_empty() {
                continue;
            }
            handled = true;
            trace!("exi{}: irq {:?}", ch, sources);

            if sources.contains(IrqSources::TRANSFER_COMPLETE) {
                self.complete_transfer(ch, Ok(()));
            }

            if sources.contains(IrqSources::EXTERNAL) {
                self.channels[ch].media_changed.store(true, Ordering::Release);
                self.note_reset_progress();
                if csr.device_present() {
                    debug!("exi{}: device inserted", ch);
                    self.latch_event(ch, EventId::Insert);
                    self.schedule_deferred(ch);
                } else {
                    debug!("exi{}: device removed", ch);
                    self.complete_transfer(ch, Err(ExiError::Break));
                }
            }

            if sources.contains(IrqSources::DEVICE) && self.latch_event(ch, EventId::Irq) {
                self.schedule_deferred(ch);
            }
        }
        handled
    }
}
