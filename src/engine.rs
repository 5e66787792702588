//! Command dispatch and the transfer state machine.
//!
//! Transfers take one of three paths:
//!
//! * busy-wait immediate, for short buffers or when DMA is forbidden;
//! * interrupt-driven immediate (IDI), one ≤4-byte chunk per interrupt;
//! * DMA for the aligned body, with the unaligned head moved up front
//!   and the tail moved once the DMA interrupt arrives.
//!
//! Whatever the path, the command's continuation fires exactly once.

use log::{trace, warn};

use crate::bus::ExiBus;
use crate::channel::{ChannelState, ChannelStats, Holder, InFlight};
use crate::command::{split_transfer, Command, CommandFlags, Opcode};
use crate::config::{DMA_ALIGN, IMMEDIATE_MAX};
use crate::platform::{DmaDirection, Platform};
use crate::raw::DmaRegion;
use crate::regs::{IrqSources, TransferKind};
use crate::status::{ExiError, ExiResult};

/// Outcome of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Finished; the continuation has already fired.
    Done,
    /// Accepted; the continuation fires from the interrupt path.
    Pending,
}

impl Dispatch {
    #[inline]
    pub fn is_pending(self) -> bool {
        self == Dispatch::Pending
    }
}

/// What claiming the command slot led to.
enum Claim {
    /// The submitting context runs the transfer.
    Run(Command),
    /// IDI started; the interrupt path owns the command now.
    Started,
    Busy(Command),
}

fn dma_direction(kind: TransferKind) -> DmaDirection {
    match kind {
        TransferKind::Read => DmaDirection::FromDevice,
        _ => DmaDirection::ToDevice,
    }
}

impl<P: Platform> ExiBus<P> {
    /// Run `cmd`.
    ///
    /// Errors found before the command starts (busy channel, bad owner)
    /// are returned here and also delivered to the continuation. Once a
    /// transfer is accepted its result only reaches the continuation.
    pub fn submit(&self, cmd: Command) -> ExiResult<Dispatch> {
        let channel = cmd.channel;
        if let Err(e) = self.check_channel(channel) {
            cmd.complete(Err(e));
            return Err(e);
        }

        let result = match cmd.opcode {
            Opcode::Nop => Ok(()),
            Opcode::Take => match cmd.device {
                Some(dev) => self.take_channel(
                    channel,
                    Holder::Device(dev),
                    !cmd.flags.contains(CommandFlags::NOWAIT),
                ),
                None => Err(ExiError::InvalidDevice),
            },
            Opcode::Give => match cmd.device {
                Some(dev) => self.give_channel(channel, Holder::Device(dev)),
                None => Err(ExiError::InvalidDevice),
            },
            Opcode::Select => match cmd.device {
                Some(dev) => {
                    self.raw(channel).select(dev.slot(), dev.frequency());
                    Ok(())
                }
                None => Err(ExiError::InvalidDevice),
            },
            Opcode::Deselect => {
                self.raw(channel).deselect();
                Ok(())
            }
            Opcode::Read | Opcode::Write | Opcode::ReadWrite => return self.start_transfer(cmd),
        };

        cmd.complete(result);
        result.map(|_| Dispatch::Done)
    }

    fn start_transfer(&self, mut cmd: Command) -> ExiResult<Dispatch> {
        let channel = cmd.channel;
        let Some(kind) = cmd.opcode.transfer_kind() else {
            cmd.complete(Err(ExiError::Unsupported));
            return Err(ExiError::Unsupported);
        };
        let len = cmd.data.len();
        if len == 0 {
            cmd.complete(Ok(()));
            return Ok(Dispatch::Done);
        }

        let ch = &self.channels[channel];
        cmd = match ch.with_state(&self.platform, |st| self.claim_slot(st, cmd, kind)) {
            Claim::Run(cmd) => cmd,
            Claim::Started => return Ok(Dispatch::Pending),
            Claim::Busy(cmd) => {
                cmd.complete(Err(ExiError::Busy));
                return Err(ExiError::Busy);
            }
        };

        if len < DMA_ALIGN || cmd.flags.contains(CommandFlags::NODMA) {
            let result = self.raw(channel).transfer_immediate(cmd.data.as_mut_slice(), kind);
            self.free_slot(channel);
            self.retire(cmd, result);
            return Ok(Dispatch::Done);
        }

        let split = split_transfer(cmd.data.addr(), len);
        if split.body == 0 {
            // head and tail touch; nothing for DMA
            let result = self.raw(channel).transfer_immediate(cmd.data.as_mut_slice(), kind);
            self.free_slot(channel);
            self.retire(cmd, result);
            return Ok(Dispatch::Done);
        }

        if split.pre > 0 {
            let head = self
                .raw(channel)
                .transfer_immediate(cmd.data.range_mut(split.pre_range()), kind);
            if let Err(e) = head {
                self.free_slot(channel);
                self.retire(cmd, Err(e));
                return Ok(Dispatch::Done);
            }
        }

        let dir = dma_direction(kind);
        let addr = self
            .platform
            .dma_map(cmd.data.range_mut(split.body_range()), dir);
        let region = match DmaRegion::new(addr, split.body) {
            Ok(region) => region,
            Err(e) => {
                warn!(
                    "exi{}: platform mapped dma to {:#010x}, not {}-byte aligned",
                    channel, addr.0, DMA_ALIGN
                );
                self.platform.dma_unmap(addr, split.body, dir);
                self.free_slot(channel);
                self.retire(cmd, Err(e));
                return Ok(Dispatch::Done);
            }
        };
        cmd.dma = Some((addr, split.body));
        let post = (split.post > 0).then(|| split.post_range());

        ch.with_state(&self.platform, |st| {
            self.raw(channel).start_dma(region, kind);
            st.in_flight = Some(InFlight::Dma { cmd, kind, post });
        });
        Ok(Dispatch::Pending)
    }

    /// Occupy the command slot. An IDI transfer starts here, under the
    /// same lock the completion path takes.
    fn claim_slot(&self, st: &mut ChannelState<P>, mut cmd: Command, kind: TransferKind) -> Claim {
        if st.in_flight.is_some() {
            return Claim::Busy(cmd);
        }
        if !cmd.flags.contains(CommandFlags::IDI) {
            st.in_flight = Some(InFlight::Immediate);
            return Claim::Run(cmd);
        }

        let n = cmd.data.len().min(IMMEDIATE_MAX);
        cmd.bytes_left = cmd.data.len();
        let raw = self.raw(cmd.channel);
        raw.enable_irqs(IrqSources::TRANSFER_COMPLETE);
        raw.start_immediate(&cmd.data.as_slice()[..n], kind);
        ChannelStats::bump(&self.channels[cmd.channel].stats.idi_steps);
        st.in_flight = Some(InFlight::Idi { cmd, kind });
        Claim::Started
    }

    fn free_slot(&self, channel: usize) {
        self.channels[channel].with_state(&self.platform, |st| st.in_flight = None);
    }

    /// Completion path for the interrupt-driven and DMA transfers.
    ///
    /// `result` is what the hardware reported: `Ok` for transfer-complete,
    /// `Break` for an extraction, `Timeout` from a polled wait.
    pub(crate) fn complete_transfer(&self, channel: usize, result: ExiResult) {
        let finished = self.channels[channel]
            .with_state(&self.platform, |st| self.advance(channel, st, result));
        if let Some((cmd, result)) = finished {
            self.retire(cmd, result);
        }
    }

    /// Move the in-flight transfer on by one interrupt. Hands the command
    /// back once it has left the slot.
    fn advance(
        &self,
        channel: usize,
        st: &mut ChannelState<P>,
        result: ExiResult,
    ) -> Option<(Command, ExiResult)> {
        let raw = self.raw(channel);
        match st.in_flight.take() {
            None => {
                trace!("exi{}: completion with nothing in flight", channel);
                None
            }
            Some(InFlight::Immediate) => {
                // a busy-wait transfer owns the channel; it acks its own TC
                st.in_flight = Some(InFlight::Immediate);
                None
            }
            Some(InFlight::Dma { mut cmd, kind, post }) => {
                raw.disable_irqs(IrqSources::TRANSFER_COMPLETE);
                if let Some((addr, len)) = cmd.dma.take() {
                    self.platform.dma_unmap(addr, len, dma_direction(kind));
                }
                let result = match (result, post) {
                    (Ok(()), Some(range)) => raw.transfer_immediate(cmd.data.range_mut(range), kind),
                    (result, _) => result,
                };
                Some((cmd, result))
            }
            Some(InFlight::Idi { mut cmd, kind }) => {
                raw.disable_irqs(IrqSources::TRANSFER_COMPLETE);
                if result.is_err() {
                    return Some((cmd, result));
                }

                let len = cmd.data.len();
                let offset = len - cmd.bytes_left;
                let n = cmd.bytes_left.min(IMMEDIATE_MAX);
                raw.finish_immediate(cmd.data.range_mut(offset..offset + n), kind);
                cmd.bytes_left -= n;

                if cmd.bytes_left > IMMEDIATE_MAX && self.config.idi_balance > 0 {
                    let offset = len - cmd.bytes_left;
                    let extra = self.config.idi_balance.min(cmd.bytes_left - IMMEDIATE_MAX);
                    if let Err(e) =
                        raw.transfer_immediate(cmd.data.range_mut(offset..offset + extra), kind)
                    {
                        return Some((cmd, Err(e)));
                    }
                    cmd.bytes_left -= extra;
                }

                if cmd.bytes_left == 0 {
                    return Some((cmd, Ok(())));
                }

                let offset = len - cmd.bytes_left;
                let n = cmd.bytes_left.min(IMMEDIATE_MAX);
                raw.enable_irqs(IrqSources::TRANSFER_COMPLETE);
                raw.start_immediate(&cmd.data.as_slice()[offset..offset + n], kind);
                ChannelStats::bump(&self.channels[channel].stats.idi_steps);
                st.in_flight = Some(InFlight::Idi { cmd, kind });
                None
            }
        }
    }

    /// Fire the continuation of a command that has left its channel's
    /// slot, then let latched events in.
    fn retire(&self, cmd: Command, result: ExiResult) {
        cmd.complete(result);
        self.check_pending_work();
    }

    /// Drive an in-flight asynchronous transfer to the end without
    /// interrupts. For callers that cannot sleep.
    pub fn poll_transfer(&self, channel: usize) {
        if self.check_channel(channel).is_err() {
            return;
        }
        let ch = &self.channels[channel];
        while ch.with_state(&self.platform, |st| st.has_async_transfer()) {
            let result = self.raw(channel).wait_dma();
            self.complete_transfer(channel, result);
        }
    }
}
