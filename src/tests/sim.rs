//! Register-level model of the EXI controller for host tests.
//!
//! Transfers finish the moment CR is written unless the channel is
//! stalled. The clock advances on every read so bounded waits always end.
//!
//! The top half runs on whichever thread the interrupt "arrives" on:
//! always from `idle()`, and with synchronous delivery on, right after
//! any register write made with interrupts on, or on leaving the
//! outermost `without_interrupts`. Each thread is one CPU.

use core::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Weak};
use std::vec;
use std::vec::Vec;

use spin::Mutex;

use crate::bus::ExiBus;
use crate::config::{BusConfig, NUM_CHANNELS};
use crate::platform::{Clock, DmaAddr, DmaDirection, Platform, Register};
use crate::regs::{Cr, Csr, IrqSources, TransferKind};

/// What sits behind one chip select.
#[derive(Debug, Clone)]
pub enum Peripheral {
    /// Nothing answers; reads shift in zeroes.
    Empty,
    /// Answers the id command: two command bytes, then the id big-endian.
    Id { id: u32, pos: usize },
    /// Records what is written and plays back `feed` on reads.
    Stream {
        written: Vec<u8>,
        feed: VecDeque<u8>,
    },
}

impl Peripheral {
    pub fn id(id: u32) -> Self {
        Peripheral::Id { id, pos: 0 }
    }

    pub fn stream(feed: &[u8]) -> Self {
        Peripheral::Stream {
            written: Vec::new(),
            feed: feed.iter().copied().collect(),
        }
    }

    fn on_select(&mut self) {
        if let Peripheral::Id { pos, .. } = self {
            *pos = 0;
        }
    }

    fn exchange(&mut self, out: u8, kind: TransferKind) -> u8 {
        match self {
            Peripheral::Empty => 0,
            Peripheral::Id { id, pos } => {
                let i = *pos;
                *pos += 1;
                match i {
                    2..=5 => id.to_be_bytes()[i - 2],
                    _ => 0,
                }
            }
            Peripheral::Stream { written, feed } => {
                if kind.writes() {
                    written.push(out);
                }
                if kind.reads() {
                    feed.pop_front().unwrap_or(0)
                } else {
                    0
                }
            }
        }
    }
}

struct Mapping {
    bus: u32,
    ptr: *mut u8,
    len: usize,
    dir: DmaDirection,
}

struct Lane {
    csr: Csr,
    mar: u32,
    len: u32,
    cr: Cr,
    data: u32,
    slots: [Peripheral; 3],
    stalled: bool,
}

impl Lane {
    fn new() -> Self {
        Self {
            csr: Csr::empty(),
            mar: 0,
            len: 0,
            cr: Cr::empty(),
            data: 0,
            slots: [Peripheral::Empty, Peripheral::Empty, Peripheral::Empty],
            stalled: false,
        }
    }
}

struct Hw {
    lanes: [Lane; NUM_CHANNELS],
    maps: Vec<Mapping>,
    next_bus: u32,
    bad_dma: bool,
}

// The raw pointers in `maps` are only dereferenced while a command owns
// the mapped buffer.
unsafe impl Send for Hw {}

std::thread_local! {
    /// `without_interrupts` nesting depth on this thread.
    static IRQ_OFF: Cell<usize> = Cell::new(0);
}

fn irqs_on() -> bool {
    IRQ_OFF.with(Cell::get) == 0
}

fn hold_irqs() {
    IRQ_OFF.with(|d| d.set(d.get() + 1));
}

fn restore_irqs() {
    IRQ_OFF.with(|d| d.set(d.get() - 1));
}

pub struct SimPlatform {
    hw: Mutex<Hw>,
    now: AtomicU64,
    in_atomic: AtomicBool,
    sync_irq: AtomicBool,
    deferred: Mutex<Vec<usize>>,
    /// Wake generation; sleepers in `wait_until` wait for it to move.
    gate: std::sync::Mutex<u64>,
    gate_cv: Condvar,
    wakes: [AtomicUsize; NUM_CHANNELS],
    sleeps: [AtomicUsize; NUM_CHANNELS],
    bus: Weak<SimBus>,
}

impl SimPlatform {
    fn run(&self, hw: &mut Hw, ch: usize) {
        let lane = &mut hw.lanes[ch];
        let Some(kind) = lane.cr.kind() else {
            return;
        };
        let slot = lane.csr.selected_slot().map(usize::from);

        if lane.cr.contains(Cr::DMA) {
            let (mar, len) = (lane.mar, lane.len as usize);
            let Some(map) = hw
                .maps
                .iter()
                .find(|m| m.bus <= mar && (mar - m.bus) as usize + len <= m.len)
            else {
                panic!("exi{ch}: dma to unmapped {mar:#x}+{len}");
            };
            // SAFETY: the mapping covers `mar..mar+len` and the buffer stays
            // alive and unborrowed until unmap.
            let mem = unsafe {
                core::slice::from_raw_parts_mut(map.ptr.add((mar - map.bus) as usize), len)
            };
            for b in mem.iter_mut() {
                let got = match slot {
                    Some(s) => lane.slots[s].exchange(*b, kind),
                    None => 0,
                };
                if kind.reads() {
                    *b = got;
                }
            }
        } else {
            let n = lane.cr.immediate_len();
            let mut word = lane.data.to_be_bytes();
            for b in word.iter_mut().take(n) {
                let got = match slot {
                    Some(s) => lane.slots[s].exchange(*b, kind),
                    None => 0,
                };
                if kind.reads() {
                    *b = got;
                }
            }
            if kind.reads() {
                lane.data = u32::from_be_bytes(word);
            }
        }
        lane.cr.remove(Cr::TSTART);
        lane.csr.insert(Csr::TCINT);
    }

    fn write_lane(&self, channel: usize, reg: Register, value: u32) {
        let mut hw = self.hw.lock();
        let lane = &mut hw.lanes[channel];
        match reg {
            Register::Csr => {
                let value = Csr::from_bits_retain(value);
                let was = lane.csr.selected_slot();
                let status = (lane.csr & Csr::INT_STATUS) - (value & Csr::INT_STATUS);
                let writable = Csr::INT_MASKS | Csr::CLK | Csr::CS | Csr::ROMDIS;
                lane.csr = (value & writable) | status | (lane.csr & Csr::EXT);
                let now = lane.csr.selected_slot();
                if let (None, Some(s)) = (was, now) {
                    lane.slots[usize::from(s)].on_select();
                }
            }
            Register::Mar => lane.mar = value,
            Register::Length => lane.len = value,
            Register::Data => lane.data = value,
            Register::Cr => {
                lane.cr = Cr::from_bits_retain(value);
                if lane.cr.busy() && !lane.stalled {
                    self.run(&mut hw, channel);
                }
            }
        }
    }

    fn irq_asserted(&self) -> bool {
        let hw = self.hw.lock();
        hw.lanes
            .iter()
            .any(|lane| !IrqSources::pending(lane.csr).is_empty())
    }

    /// Take the interrupt on this thread if it is asserted and this
    /// thread has interrupts on. The top half runs with them off.
    fn deliver(&self) {
        if !irqs_on() {
            return;
        }
        let Some(sim) = self.bus.upgrade() else {
            return;
        };
        while self.irq_asserted() {
            hold_irqs();
            sim.bus.handle_irq();
            restore_irqs();
        }
    }

    fn deliver_sync(&self) {
        if self.sync_irq.load(Ordering::Relaxed) {
            self.deliver();
        }
    }
}

impl Clock for SimPlatform {
    fn now_micros(&self) -> u64 {
        self.now.fetch_add(1, Ordering::Relaxed)
    }
}

impl Platform for SimPlatform {
    fn read_reg(&self, channel: usize, reg: Register) -> u32 {
        let hw = self.hw.lock();
        let lane = &hw.lanes[channel];
        match reg {
            Register::Csr => lane.csr.bits(),
            Register::Mar => lane.mar,
            Register::Length => lane.len,
            Register::Cr => lane.cr.bits(),
            Register::Data => lane.data,
        }
    }

    fn write_reg(&self, channel: usize, reg: Register, value: u32) {
        self.write_lane(channel, reg, value);
        self.deliver_sync();
    }

    fn dma_map(&self, buf: &mut [u8], dir: DmaDirection) -> DmaAddr {
        let mut hw = self.hw.lock();
        let low = buf.as_ptr() as u32 & 0x1f;
        let bus = hw.next_bus + low + if hw.bad_dma { 4 } else { 0 };
        hw.next_bus += ((buf.len() as u32 + 64) + 31) & !31;
        hw.maps.push(Mapping {
            bus,
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
            dir,
        });
        DmaAddr(bus)
    }

    fn dma_unmap(&self, addr: DmaAddr, len: usize, dir: DmaDirection) {
        let mut hw = self.hw.lock();
        let Some(i) = hw.maps.iter().position(|m| m.bus == addr.0 && m.len == len) else {
            panic!("unmap of unknown {:#x}", addr.0);
        };
        let map = hw.maps.remove(i);
        assert_eq!(map.dir, dir, "{:#x} unmapped in the wrong direction", addr.0);
    }

    fn schedule_deferred(&self, channel: usize) {
        self.deferred.lock().push(channel);
    }

    fn in_atomic(&self) -> bool {
        self.in_atomic.load(Ordering::Relaxed)
    }

    fn without_interrupts<R, F: FnOnce() -> R>(&self, f: F) -> R {
        hold_irqs();
        let r = f();
        restore_irqs();
        self.deliver_sync();
        r
    }

    fn idle(&self) {
        self.deliver();
        std::thread::yield_now();
    }

    fn wait_until(&self, channel: usize, ready: &mut dyn FnMut() -> bool) {
        loop {
            let seen = *self.gate.lock().unwrap();
            self.deliver();
            if ready() {
                return;
            }
            self.sleeps[channel].fetch_add(1, Ordering::Relaxed);
            let gen = self.gate.lock().unwrap();
            drop(self.gate_cv.wait_while(gen, |g| *g == seen).unwrap());
        }
    }

    fn wake(&self, channel: usize) {
        self.wakes[channel].fetch_add(1, Ordering::Relaxed);
        *self.gate.lock().unwrap() += 1;
        self.gate_cv.notify_all();
    }
}

/// A bus wired to the simulated controller.
pub struct SimBus {
    bus: ExiBus<SimPlatform>,
}

impl SimBus {
    pub fn new() -> Arc<Self> {
        Self::with_config(BusConfig::new().with_timeouts(200, 2_000))
    }

    pub fn with_config(config: BusConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| SimBus {
            bus: ExiBus::new(
                SimPlatform {
                    hw: Mutex::new(Hw {
                        lanes: core::array::from_fn(|_| Lane::new()),
                        maps: Vec::new(),
                        next_bus: 0x0100_0000,
                        bad_dma: false,
                    }),
                    now: AtomicU64::new(0),
                    in_atomic: AtomicBool::new(false),
                    sync_irq: AtomicBool::new(false),
                    deferred: Mutex::new(Vec::new()),
                    gate: std::sync::Mutex::new(0),
                    gate_cv: Condvar::new(),
                    wakes: Default::default(),
                    sleeps: Default::default(),
                    bus: weak.clone(),
                },
                config,
            ),
        })
    }

    pub fn bus(&self) -> &ExiBus<SimPlatform> {
        &self.bus
    }

    fn hw(&self) -> spin::MutexGuard<'_, Hw> {
        self.bus.platform().hw.lock()
    }

    pub fn attach(&self, channel: usize, slot: usize, peripheral: Peripheral) {
        self.hw().lanes[channel].slots[slot] = peripheral;
    }

    pub fn peripheral(&self, channel: usize, slot: usize) -> Peripheral {
        self.hw().lanes[channel].slots[slot].clone()
    }

    /// Bytes a `Stream` peripheral has seen written.
    pub fn written(&self, channel: usize, slot: usize) -> Vec<u8> {
        match self.peripheral(channel, slot) {
            Peripheral::Stream { written, .. } => written,
            _ => vec![],
        }
    }

    pub fn csr(&self, channel: usize) -> Csr {
        self.hw().lanes[channel].csr
    }

    pub fn set_csr_bits(&self, channel: usize, bits: Csr) {
        self.hw().lanes[channel].csr.insert(bits);
    }

    /// Hold transfers on `channel` in flight until released.
    pub fn stall(&self, channel: usize, stalled: bool) {
        self.hw().lanes[channel].stalled = stalled;
    }

    /// Finish a stalled transfer.
    pub fn release(&self, channel: usize) {
        let platform = self.bus.platform();
        let mut hw = platform.hw.lock();
        hw.lanes[channel].stalled = false;
        if hw.lanes[channel].cr.busy() {
            platform.run(&mut hw, channel);
        }
    }

    /// Make `dma_map` hand back addresses that break the alignment rule.
    pub fn break_dma_mapping(&self) {
        self.hw().bad_dma = true;
    }

    pub fn live_mappings(&self) -> usize {
        self.hw().maps.len()
    }

    pub fn set_in_atomic(&self, on: bool) {
        self.bus.platform().in_atomic.store(on, Ordering::Relaxed);
    }

    /// Deliver interrupts the moment they assert, on the thread that
    /// caused them, unless it has them held off.
    pub fn set_sync_irq(&self, on: bool) {
        self.bus.platform().sync_irq.store(on, Ordering::Relaxed);
    }

    /// Take a pending interrupt on this thread, the way the interrupt
    /// controller would.
    pub fn service(&self) {
        self.bus.platform().deliver();
    }

    /// Times `wake(channel)` was called.
    pub fn wakes(&self, channel: usize) -> usize {
        self.bus.platform().wakes[channel].load(Ordering::Relaxed)
    }

    /// Times a taker went to sleep on `channel`.
    pub fn sleeps(&self, channel: usize) -> usize {
        self.bus.platform().sleeps[channel].load(Ordering::Relaxed)
    }

    pub fn raise_device_irq(&self, channel: usize) {
        self.set_csr_bits(channel, Csr::EXIINT);
    }

    pub fn insert(&self, channel: usize) {
        self.set_csr_bits(channel, Csr::EXT | Csr::EXTINT);
    }

    pub fn extract(&self, channel: usize) {
        let mut hw = self.hw();
        let lane = &mut hw.lanes[channel];
        lane.csr.remove(Csr::EXT);
        lane.csr.insert(Csr::EXTINT);
    }

    pub fn irq_asserted(&self) -> bool {
        self.bus.platform().irq_asserted()
    }

    /// Channels with a deferred pass requested and not yet run.
    pub fn scheduled(&self) -> Vec<usize> {
        self.bus.platform().deferred.lock().clone()
    }

    /// Run every requested deferred pass, including ones requested while
    /// running. Returns how many ran.
    pub fn run_deferred(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = {
                let mut q = self.bus.platform().deferred.lock();
                if q.is_empty() {
                    None
                } else {
                    Some(q.remove(0))
                }
            };
            let Some(ch) = next else {
                return ran;
            };
            self.bus.run_deferred(ch);
            ran += 1;
        }
    }
}
