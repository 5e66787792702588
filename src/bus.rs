//! The bus context and the API calling drivers use.

use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};

use crate::channel::{Channel, ChannelStatsSnapshot, Holder};
use crate::command::{Command, CommandFlags, Completion, CompletionSignal, Continuation, Opcode};
use crate::config::{BusConfig, EXI_ID_INVALID, EXI_ID_NONE, NUM_CHANNELS};
use crate::device::ExiDevice;
use crate::platform::Platform;
use crate::raw::RawChannel;
use crate::regs::IrqSources;
use crate::status::{ExiError, ExiResult};
use crate::structs::aligned_buffer::TransferBuf;

/// Owns every channel of one EXI controller.
///
/// Shared by reference between task context, the deferred-work context
/// and the interrupt handler; all interior state is behind per-channel
/// locks.
pub struct ExiBus<P: Platform> {
    pub(crate) platform: P,
    pub(crate) config: BusConfig,
    pub(crate) channels: [Channel<P>; NUM_CHANNELS],
    resetting: AtomicBool,
    reset_done: AtomicBool,
}

impl<P: Platform> ExiBus<P> {
    pub fn new(platform: P, config: BusConfig) -> Self {
        Self {
            platform,
            config,
            channels: core::array::from_fn(Channel::new),
            resetting: AtomicBool::new(false),
            reset_done: AtomicBool::new(false),
        }
    }

    /// Bring every channel to a known state and hook the interrupt.
    pub fn init(&self) {
        self.quiesce();
        for ch in 0..NUM_CHANNELS {
            self.raw(ch).enable_irqs(IrqSources::EXTERNAL);
        }
        self.platform.enable_irq();
        info!("exi: {} channels ready", NUM_CHANNELS);
    }

    /// Deselect everything, mask and ack every source.
    pub fn quiesce(&self) {
        for ch in 0..NUM_CHANNELS {
            self.raw(ch).quiesce();
        }
    }

    #[inline]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    #[inline]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub(crate) fn raw(&self, channel: usize) -> RawChannel<'_, P> {
        let ch = &self.channels[channel];
        RawChannel {
            platform: &self.platform,
            index: ch.index,
            io_lock: &ch.io_lock,
            stats: &ch.stats,
            config: &self.config,
        }
    }

    pub(crate) fn check_channel(&self, channel: usize) -> ExiResult {
        if channel < NUM_CHANNELS {
            Ok(())
        } else {
            Err(ExiError::InvalidDevice)
        }
    }

    /// Acquire `device`'s channel. With `blocking` set, waits for the
    /// current holder to give it up; otherwise fails with `Busy`.
    pub fn take(&self, device: ExiDevice, blocking: bool) -> ExiResult {
        let flags = if blocking {
            CommandFlags::empty()
        } else {
            CommandFlags::NOWAIT
        };
        self.submit(Command::take(device, flags)).map(|_| ())
    }

    pub fn give(&self, device: ExiDevice) -> ExiResult {
        self.submit(Command::give(device)).map(|_| ())
    }

    pub fn select(&self, device: ExiDevice) -> ExiResult {
        self.submit(Command::select(device)).map(|_| ())
    }

    pub fn deselect(&self, channel: usize) -> ExiResult {
        self.submit(Command::deselect(channel)?).map(|_| ())
    }

    /// Claim `channel`. A blocked taker sleeps in
    /// [`Platform::wait_until`] until a give wakes it.
    pub(crate) fn take_channel(&self, channel: usize, holder: Holder, wait: bool) -> ExiResult {
        let ch = &self.channels[channel];
        loop {
            if ch.try_take(&self.platform, holder) {
                debug!("exi{}: taken by {:?}", channel, holder);
                return Ok(());
            }
            if !wait {
                return Err(ExiError::Busy);
            }
            self.platform
                .wait_until(channel, &mut || ch.owner(&self.platform).is_none());
        }
    }

    pub(crate) fn give_channel(&self, channel: usize, holder: Holder) -> ExiResult {
        let given = self.channels[channel].with_state(&self.platform, |st| {
            if st.owner != Some(holder) {
                return false;
            }
            st.owner = None;
            true
        });
        if !given {
            return Err(ExiError::NotOwner);
        }
        debug!("exi{}: given by {:?}", channel, holder);
        self.platform.wake(channel);
        self.check_pending_work();
        Ok(())
    }

    pub fn is_taken(&self, channel: usize) -> bool {
        self.channels
            .get(channel)
            .map_or(false, |ch| ch.owner(&self.platform).is_some())
    }

    pub fn owner(&self, channel: usize) -> Option<Holder> {
        self.channels.get(channel)?.owner(&self.platform)
    }

    pub fn is_transfer_pending(&self, channel: usize) -> bool {
        self.channels
            .get(channel)
            .map_or(false, |ch| {
                ch.with_state(&self.platform, |st| st.in_flight.is_some())
            })
    }

    /// Submit `opcode` over `buf` and wait for it to finish.
    ///
    /// Sleeps on the completion when the platform allows it, otherwise
    /// polls the hardware to completion.
    pub fn transfer(
        &self,
        channel: usize,
        buf: &mut [u8],
        opcode: Opcode,
        flags: CommandFlags,
    ) -> ExiResult {
        let kind = opcode.transfer_kind().ok_or(ExiError::Unsupported)?;
        // keep the caller's line offset so the head/body/tail split matches
        let data = TransferBuf::from_slice_at(buf, buf.as_ptr() as usize);
        let signal = CompletionSignal::new();
        let cmd = Command::transfer(channel, opcode, data, flags)?
            .with_continuation(Continuation::Signal(signal.clone()));

        let done = self.submit_and_wait(cmd, &signal)?;
        if kind.reads() {
            buf.copy_from_slice(done.data.as_slice());
        }
        done.result
    }

    fn submit_and_wait(&self, cmd: Command, signal: &CompletionSignal) -> ExiResult<Completion> {
        let channel = cmd.channel;
        if self.submit(cmd)?.is_pending() && self.platform.in_atomic() {
            self.poll_transfer(channel);
        }
        Ok(signal.wait(|| self.platform.idle()))
    }

    /// Select `device`, read `buf.len()` bytes, deselect.
    pub fn device_read(&self, device: ExiDevice, buf: &mut [u8]) -> ExiResult {
        self.selected_transfer(device, buf, Opcode::Read)
    }

    /// Select `device`, write `data`, deselect.
    pub fn device_write(&self, device: ExiDevice, data: &[u8]) -> ExiResult {
        let mut buf = alloc::vec::Vec::from(data);
        self.selected_transfer(device, &mut buf, Opcode::Write)
    }

    /// Select `device`, clock `buf` out while clocking its replacement
    /// in, deselect.
    pub fn device_exchange(&self, device: ExiDevice, buf: &mut [u8]) -> ExiResult {
        self.selected_transfer(device, buf, Opcode::ReadWrite)
    }

    fn selected_transfer(&self, device: ExiDevice, buf: &mut [u8], opcode: Opcode) -> ExiResult {
        self.select(device)?;
        let r = self.transfer(device.channel(), buf, opcode, CommandFlags::empty());
        self.deselect(device.channel())?;
        r
    }

    /// Device-present line of `channel`.
    pub fn get_ext_line(&self, channel: usize) -> bool {
        channel < NUM_CHANNELS && self.raw(channel).csr().device_present()
    }

    /// Read the peripheral's identification word.
    ///
    /// Writes the two-byte id command and reads four bytes back. Nothing
    /// answering yields [`EXI_ID_INVALID`], except in a memory card bay
    /// with a card present, which yields [`EXI_ID_NONE`].
    pub fn get_id(&self, device: ExiDevice) -> u32 {
        let channel = device.channel();
        let locked = self
            .take_channel(channel, Holder::Device(device), false)
            .is_ok();

        let mut cmd = [0u8; 2];
        let mut id = [0u8; 4];
        let read = self
            .select(device)
            .and_then(|_| self.transfer(channel, &mut cmd, Opcode::Write, CommandFlags::empty()))
            .and_then(|_| self.transfer(channel, &mut id, Opcode::Read, CommandFlags::empty()));
        if let Err(e) = self.deselect(channel) {
            warn!("exi{}: deselect after id read failed: {}", channel, e);
        }
        if locked {
            if let Err(e) = self.give_channel(channel, Holder::Device(device)) {
                warn!("exi{}: could not give channel after id read: {}", channel, e);
            }
        }

        let mut id = match read {
            Ok(()) => u32::from_be_bytes(id),
            Err(_) => EXI_ID_INVALID,
        };
        if id == 0 {
            id = EXI_ID_INVALID;
        }
        if id == EXI_ID_INVALID && device.is_memcard_slot() && self.get_ext_line(channel) {
            id = EXI_ID_NONE;
        }
        id
    }

    /// Test-and-clear the media-changed flag of `channel`.
    pub fn take_media_changed(&self, channel: usize) -> bool {
        self.channels
            .get(channel)
            .map_or(false, |ch| ch.media_changed.swap(false, Ordering::AcqRel))
    }

    /// Arm reset tracking before handing the bus to firmware that resets
    /// the attached devices; the next EXT interrupt marks it done.
    pub fn begin_reset_wait(&self) {
        self.reset_done.store(false, Ordering::Release);
        self.resetting.store(true, Ordering::Release);
    }

    pub fn reset_done(&self) -> bool {
        self.reset_done.load(Ordering::Acquire)
    }

    pub(crate) fn note_reset_progress(&self) {
        if self.resetting.swap(false, Ordering::AcqRel) {
            self.reset_done.store(true, Ordering::Release);
            info!("exi: device reset observed");
        }
    }

    pub fn stats(&self, channel: usize) -> Option<ChannelStatsSnapshot> {
        Some(self.channels.get(channel)?.stats.snapshot())
    }
}
