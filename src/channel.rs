use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;
use strum::EnumCount;

use crate::command::Command;
use crate::device::ExiDevice;
use crate::event::{EventId, EventSlot, PendingEvents};
use crate::platform::Platform;
use crate::regs::TransferKind;

/// Who currently holds a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    Device(ExiDevice),
    /// Reserved for the duration of an event handler.
    Event,
}

/// What occupies a channel's command slot.
#[derive(Debug)]
pub(crate) enum InFlight {
    /// A busy-wait transfer is running on the submitting context.
    Immediate,
    /// Interrupt-driven immediate; one ≤4-byte chunk on the wire.
    Idi { cmd: Command, kind: TransferKind },
    /// DMA running; `post` is the tail to move once it lands.
    Dma {
        cmd: Command,
        kind: TransferKind,
        post: Option<core::ops::Range<usize>>,
    },
}

pub(crate) struct ChannelState<P: Platform> {
    pub(crate) owner: Option<Holder>,
    pub(crate) in_flight: Option<InFlight>,
    /// Events latched by the top half and not yet dispatched.
    pub(crate) pending: PendingEvents,
    pub(crate) events: [Option<EventSlot<P>>; EventId::COUNT],
}

impl<P: Platform> ChannelState<P> {
    fn new() -> Self {
        Self {
            owner: None,
            in_flight: None,
            pending: PendingEvents::empty(),
            events: core::array::from_fn(|_| None),
        }
    }

    /// Free and not moving data.
    #[inline]
    pub(crate) fn is_idle(&self) -> bool {
        self.owner.is_none() && self.in_flight.is_none()
    }

    #[inline]
    pub(crate) fn has_async_transfer(&self) -> bool {
        matches!(
            self.in_flight,
            Some(InFlight::Idi { .. }) | Some(InFlight::Dma { .. })
        )
    }
}

#[derive(Default)]
pub(crate) struct ChannelStats {
    pub(crate) immediate_chunks: AtomicUsize,
    pub(crate) dma_transfers: AtomicUsize,
    pub(crate) idi_steps: AtomicUsize,
    pub(crate) events_dispatched: AtomicUsize,
    pub(crate) events_deferred: AtomicUsize,
}

/// Counters for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStatsSnapshot {
    /// Every immediate chunk, busy-wait or interrupt driven.
    pub immediate_chunks: usize,
    pub dma_transfers: usize,
    pub idi_steps: usize,
    pub events_dispatched: usize,
    /// Admission checks that found a channel busy.
    pub events_deferred: usize,
}

impl ChannelStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            immediate_chunks: self.immediate_chunks.load(Ordering::Relaxed),
            dma_transfers: self.dma_transfers.load(Ordering::Relaxed),
            idi_steps: self.idi_steps.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_deferred: self.events_deferred.load(Ordering::Relaxed),
        }
    }
}

/// One bus lane. Lock order: `state` may be held while taking `io_lock`,
/// never the other way around. Neither is taken with the EXI interrupt
/// enabled.
pub(crate) struct Channel<P: Platform> {
    pub(crate) index: usize,
    /// Guards a single CSR read-modify-write.
    pub(crate) io_lock: Mutex<()>,
    pub(crate) state: Mutex<ChannelState<P>>,
    pub(crate) deferred_scheduled: AtomicBool,
    pub(crate) media_changed: AtomicBool,
    pub(crate) stats: ChannelStats,
}

impl<P: Platform> Channel<P> {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            io_lock: Mutex::new(()),
            state: Mutex::new(ChannelState::new()),
            deferred_scheduled: AtomicBool::new(false),
            media_changed: AtomicBool::new(false),
            stats: ChannelStats::default(),
        }
    }

    /// Lock the state with the interrupt held off. The top half may use
    /// this too; the platform hook nests.
    pub(crate) fn with_state<R>(
        &self,
        platform: &P,
        f: impl FnOnce(&mut ChannelState<P>) -> R,
    ) -> R {
        platform.without_interrupts(|| f(&mut self.state.lock()))
    }

    /// Claim the channel for `holder`. Fails if anyone holds it.
    pub(crate) fn try_take(&self, platform: &P, holder: Holder) -> bool {
        self.with_state(platform, |st| {
            if st.owner.is_some() {
                return false;
            }
            st.owner = Some(holder);
            true
        })
    }

    pub(crate) fn owner(&self, platform: &P) -> Option<Holder> {
        self.with_state(platform, |st| st.owner)
    }
}
