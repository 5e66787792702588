//! Event registration and deferred dispatch.
//!
//! A handler only runs once every channel in its mask is free and idle.
//! Those channels are held by [`Holder::Event`] for the duration of the
//! call so no new command can start on them; the handler itself may
//! still drive the bus directly.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use bitflags::bitflags;
use log::{debug, trace};
use strum::{Display, EnumCount, EnumIter};

use crate::bus::ExiBus;
use crate::channel::{ChannelStats, Holder};
use crate::config::NUM_CHANNELS;
use crate::device::ExiDevice;
use crate::platform::Platform;
use crate::regs::IrqSources;
use crate::status::{ExiError, ExiResult};

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, EnumCount, EnumIter)]
pub enum EventId {
    /// Device-specific EXI interrupt.
    Irq,
    /// A card showed up on the channel.
    Insert,
    /// Owned by the command engine; cannot be registered.
    TransferComplete,
}

impl EventId {
    fn pending_bit(self) -> PendingEvents {
        match self {
            EventId::Irq => PendingEvents::IRQ,
            EventId::Insert => PendingEvents::INSERT,
            EventId::TransferComplete => PendingEvents::empty(),
        }
    }

    fn source(self) -> IrqSources {
        match self {
            EventId::Irq => IrqSources::DEVICE,
            EventId::Insert => IrqSources::EXTERNAL,
            EventId::TransferComplete => IrqSources::TRANSFER_COMPLETE,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct PendingEvents: u8 {
        const IRQ    = 1 << 0;
        const INSERT = 1 << 1;
    }
}

bitflags! {
    /// Channels an event handler touches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelMask: u8 {
        const CH0 = 1 << 0;
        const CH1 = 1 << 1;
        const CH2 = 1 << 2;
    }
}

impl ChannelMask {
    pub fn channel(ch: usize) -> Self {
        ChannelMask::from_bits_truncate(1 << ch)
    }

    pub fn channels(self) -> impl Iterator<Item = usize> {
        (0..NUM_CHANNELS).filter(move |ch| self.contains(ChannelMask::channel(*ch)))
    }
}

pub trait EventHandler<P: Platform>: Send + Sync {
    fn handle(&self, bus: &ExiBus<P>, channel: usize, event: EventId);
}

impl<P, F> EventHandler<P> for F
where
    P: Platform,
    F: Fn(&ExiBus<P>, usize, EventId) + Send + Sync,
{
    fn handle(&self, bus: &ExiBus<P>, channel: usize, event: EventId) {
        self(bus, channel, event)
    }
}

/// Pins a closure to the handler signature so its argument types infer.
pub fn event_fn<P, F>(f: F) -> F
where
    P: Platform,
    F: Fn(&ExiBus<P>, usize, EventId) + Send + Sync,
{
    f
}

pub(crate) struct EventSlot<P: Platform> {
    pub(crate) owner: ExiDevice,
    pub(crate) handler: Arc<dyn EventHandler<P>>,
    pub(crate) channel_mask: ChannelMask,
}

impl<P: Platform> ExiBus<P> {
    /// Bind `handler` to `event` on `channel`.
    ///
    /// Fails with `Busy` if the slot is taken; the existing registration
    /// is left alone.
    pub fn event_register<H>(
        &self,
        channel: usize,
        event: EventId,
        owner: ExiDevice,
        handler: H,
        channel_mask: ChannelMask,
    ) -> ExiResult
    where
        H: EventHandler<P> + 'static,
    {
        self.check_channel(channel)?;
        if event == EventId::TransferComplete {
            return Err(ExiError::Unsupported);
        }
        let handler: Arc<dyn EventHandler<P>> = Arc::new(handler);
        self.channels[channel].with_state(&self.platform, |st| {
            let slot = &mut st.events[event as usize];
            if slot.is_some() {
                return Err(ExiError::Busy);
            }
            *slot = Some(EventSlot {
                owner,
                handler,
                channel_mask,
            });
            Ok(())
        })?;
        let raw = self.raw(channel);
        raw.ack(event.source());
        raw.enable_irqs(event.source());
        debug!("exi{}: {} handler registered", channel, event);
        Ok(())
    }

    pub fn event_unregister(&self, channel: usize, event: EventId) -> ExiResult {
        self.check_channel(channel)?;
        if event == EventId::TransferComplete {
            return Err(ExiError::Unsupported);
        }
        self.channels[channel].with_state(&self.platform, |st| {
            if st.events[event as usize].take().is_none() {
                return Err(ExiError::NotRegistered);
            }
            st.pending.remove(event.pending_bit());
            Ok(())
        })?;
        match event {
            EventId::Irq => self.raw(channel).mask_and_ack(event.source()),
            // The external source stays armed: extraction tracking needs it.
            _ => self.raw(channel).ack(event.source()),
        }
        debug!("exi{}: {} handler unregistered", channel, event);
        Ok(())
    }

    /// Owner recorded for an event slot.
    pub fn event_owner(&self, channel: usize, event: EventId) -> Option<ExiDevice> {
        self.channels.get(channel)?.with_state(&self.platform, |st| {
            st.events[event as usize].as_ref().map(|slot| slot.owner)
        })
    }

    /// Latch `event` on `channel` for the next deferred pass.
    pub(crate) fn latch_event(&self, channel: usize, event: EventId) -> bool {
        self.channels[channel].with_state(&self.platform, |st| {
            st.pending.insert(event.pending_bit());
            st.owner.is_none()
        })
    }

    /// Ask the platform for a deferred pass unless one is already queued.
    pub(crate) fn schedule_deferred(&self, channel: usize) {
        let ch = &self.channels[channel];
        if !ch.deferred_scheduled.swap(true, Ordering::AcqRel) {
            self.platform.schedule_deferred(channel);
        }
    }

    /// Re-arm deferred work for channels with latched events. Called
    /// whenever a channel becomes free.
    pub(crate) fn check_pending_work(&self) {
        for ch in 0..NUM_CHANNELS {
            let pending = self.channels[ch]
                .with_state(&self.platform, |st| !st.pending.is_empty());
            if pending {
                self.schedule_deferred(ch);
            }
        }
    }

    /// Deferred-context entry point: dispatch whatever events are latched
    /// on `channel` and admissible now. Busy ones stay latched.
    pub fn run_deferred(&self, channel: usize) {
        let Some(ch) = self.channels.get(channel) else {
            return;
        };
        ch.deferred_scheduled.store(false, Ordering::Release);

        for event in [EventId::Irq, EventId::Insert] {
            let bit = event.pending_bit();
            let latched = ch.with_state(&self.platform, |st| {
                if !st.pending.contains(bit) {
                    return None;
                }
                let found = st.events[event as usize]
                    .as_ref()
                    .map(|slot| (slot.handler.clone(), slot.channel_mask));
                if found.is_none() {
                    trace!("exi{}: {} with no handler dropped", channel, event);
                    st.pending.remove(bit);
                }
                found
            });
            let Some((handler, mask)) = latched else {
                continue;
            };

            if !self.reserve_channels(mask) {
                ChannelStats::bump(&ch.stats.events_deferred);
                trace!("exi{}: {} deferred, channels busy", channel, event);
                continue;
            }
            ch.with_state(&self.platform, |st| st.pending.remove(bit));
            handler.handle(self, channel, event);
            ChannelStats::bump(&ch.stats.events_dispatched);
            self.release_channels(mask);
        }
    }

    /// Take every channel in `mask` at once, or none of them.
    fn reserve_channels(&self, mask: ChannelMask) -> bool {
        self.platform.without_interrupts(|| {
            // ascending order, same as every other multi-channel path
            let mut guards = Vec::with_capacity(NUM_CHANNELS);
            for ch in mask.channels() {
                let st = self.channels[ch].state.lock();
                if !st.is_idle() {
                    return false;
                }
                guards.push(st);
            }
            for st in guards.iter_mut() {
                st.owner = Some(Holder::Event);
            }
            true
        })
    }

    fn release_channels(&self, mask: ChannelMask) {
        for ch in mask.channels() {
            let released = self.channels[ch].with_state(&self.platform, |st| {
                let ours = st.owner == Some(Holder::Event);
                if ours {
                    st.owner = None;
                }
                ours
            });
            if released {
                self.platform.wake(ch);
            }
        }
        self.check_pending_work();
    }
}
