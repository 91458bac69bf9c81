//! Session state shared between exception context and the polling thread.
//!
//! `SessionState` is built once per session inside the physically contiguous
//! handler block and never moves until the block is released. While the
//! handlers are installed the exception path writes only the trace ring's
//! producer side, the event counters, poll suppression flags and its own
//! clock bookkeeping; everything else is read-only configuration.

use alloc::alloc::{alloc_zeroed, handle_alloc_error};
use alloc::boxed::Box;
use core::alloc::Layout;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::chip::ChipFamily;
use crate::config::SessionConfig;
use crate::debug::DebugConfig;
use crate::poll::{PollList, PollListKind};
use crate::regs::CpuRegs;
use crate::trace::{TRACE_CAPACITY, TraceRing};

/// Primary + secondary interrupt sources + GPIO lines.
pub const MAX_IRQ: usize = 32 + 2 + 120;
/// First interrupt number used for demultiplexed GPIO lines.
pub const START_GPIO_IRQS: u32 = 34;
/// Number of demultiplexed GPIO lines.
pub const NR_GPIO_IRQS: u32 = 120;
/// Capacity of the PC ignore list.
pub const MAX_IGNORE_ADDRS: usize = 64;

const IRQ_WORDS: usize = MAX_IRQ.div_ceil(32);

/// Bitmask of interrupt numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqMask {
    bits: [u32; IRQ_WORDS],
}

impl IrqMask {
    pub const fn new() -> Self {
        Self {
            bits: [0; IRQ_WORDS],
        }
    }

    /// Set bit `irq`. Returns `false` if `irq` is out of range.
    pub fn insert(&mut self, irq: u32) -> bool {
        if irq as usize >= MAX_IRQ {
            return false;
        }
        self.bits[irq as usize / 32] |= 1 << (irq % 32);
        true
    }

    pub fn remove(&mut self, irq: u32) {
        if let Some(word) = self.bits.get_mut(irq as usize / 32) {
            *word &= !(1 << (irq % 32));
        }
    }

    #[inline(always)]
    pub fn contains(&self, irq: u32) -> bool {
        match self.bits.get(irq as usize / 32) {
            Some(word) => word & (1 << (irq % 32)) != 0,
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..MAX_IRQ as u32).filter(|irq| self.contains(*irq))
    }
}

/// Registers saved by the dispatch code on every exception.
///
/// Layout is shared with the dispatch assembly: r0-r12 followed by the
/// return address.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqRegs {
    pub regs: [u32; 13],
    pub old_pc: u32,
}

/// Register reader for one exception.
///
/// r13/r14 are banked and not saved by the dispatch code; the first request
/// for either switches into the interrupted mode to fetch both, and the pair
/// is cached for the rest of this exception.
pub struct RegisterView<'a, C: CpuRegs> {
    regs: &'a IrqRegs,
    cpu: &'a C,
    banked: Option<[u32; 2]>,
}

impl<'a, C: CpuRegs> RegisterView<'a, C> {
    #[inline(always)]
    pub fn new(regs: &'a IrqRegs, cpu: &'a C) -> Self {
        Self {
            regs,
            cpu,
            banked: None,
        }
    }

    /// Value of register `nr`; 15 and above read the saved PC.
    #[inline(always)]
    pub fn get(&mut self, nr: u32) -> u32 {
        match nr {
            0..=12 => self.regs.regs[nr as usize],
            13 | 14 => {
                let cpu = self.cpu;
                let banked = self
                    .banked
                    .get_or_insert_with(|| cpu.banked_sp_lr(cpu.spsr()));
                banked[(nr - 13) as usize]
            }
            _ => self.regs.old_pc,
        }
    }
}

/// PC addresses ignored by the data watchpoint handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnoreList {
    len: usize,
    addrs: [u32; MAX_IGNORE_ADDRS],
}

impl IgnoreList {
    pub const fn new() -> Self {
        Self {
            len: 0,
            addrs: [0; MAX_IGNORE_ADDRS],
        }
    }

    pub fn from_slice(addrs: &[u32]) -> Self {
        let mut list = Self::new();
        let len = addrs.len().min(MAX_IGNORE_ADDRS);
        list.addrs[..len].copy_from_slice(&addrs[..len]);
        list.len = len;
        list
    }

    #[inline(always)]
    pub fn contains(&self, pc: u32) -> bool {
        self.addrs.get(..self.len).is_some_and(|addrs| addrs.contains(&pc))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Running event counters.
///
/// `irqs`, `aborts` and `prefetches` count every delivery. The debug
/// counters count the subset raised by the debug unit and handled here
/// without chaining.
#[derive(Debug, Default)]
pub struct EventCounters {
    pub irqs: AtomicU32,
    pub aborts: AtomicU32,
    pub prefetches: AtomicU32,
    pub debug_aborts: AtomicU32,
    pub debug_prefetches: AtomicU32,
    pub errors: AtomicU32,
}

impl EventCounters {
    pub const fn new() -> Self {
        Self {
            irqs: AtomicU32::new(0),
            aborts: AtomicU32::new(0),
            prefetches: AtomicU32::new(0),
            debug_aborts: AtomicU32::new(0),
            debug_prefetches: AtomicU32::new(0),
            errors: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub(crate) fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub irqs: u32,
    pub aborts: u32,
    pub prefetches: u32,
    pub debug_aborts: u32,
    pub debug_prefetches: u32,
    pub overflows: u32,
    pub errors: u32,
}

/// State shared by the exception path and the session driver.
#[repr(C)]
pub struct SessionState {
    trace: TraceRing<TRACE_CAPACITY>,
    counters: EventCounters,
    family: ChipFamily,
    ignored_irqs: IrqMask,
    demux_gpio: bool,
    irq_polls: PollList,
    trace_polls: PollList,
    ignore_addrs: IgnoreList,
    trace_for_watch: bool,
    debug: DebugConfig,
    last_clock: AtomicU32,
}

impl SessionState {
    /// Build the state for one session at `slot`.
    ///
    /// # Safety
    /// `slot` must be valid for writes of `Self`, suitably aligned, and must
    /// not be referenced by a running exception handler.
    pub unsafe fn init_in_place(slot: *mut Self, config: &SessionConfig, family: ChipFamily) {
        let debug = DebugConfig::from_config(config);
        unsafe {
            TraceRing::init_in_place(addr_of_mut!((*slot).trace));
            addr_of_mut!((*slot).counters).write(EventCounters::new());
            addr_of_mut!((*slot).family).write(family);
            addr_of_mut!((*slot).ignored_irqs).write(config.ignored_irqs);
            addr_of_mut!((*slot).demux_gpio).write(config.demux_gpio);
            addr_of_mut!((*slot).irq_polls)
                .write(PollList::from_slice(PollListKind::Irq, &config.irq_watches));
            addr_of_mut!((*slot).trace_polls)
                .write(PollList::from_slice(PollListKind::Trace, &config.trace_watches));
            addr_of_mut!((*slot).ignore_addrs).write(IgnoreList::from_slice(&config.ignore_addrs));
            addr_of_mut!((*slot).trace_for_watch).write(config.trace_for_watch);
            addr_of_mut!((*slot).debug).write(debug);
            addr_of_mut!((*slot).last_clock).write(AtomicU32::new(0));
        }
    }

    /// Heap-allocated state, for hosts that drive the handlers without the
    /// physical handler block.
    pub fn new_boxed(config: &SessionConfig, family: ChipFamily) -> Box<Self> {
        let layout = Layout::new::<Self>();
        unsafe {
            let ptr = alloc_zeroed(layout) as *mut Self;
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            Self::init_in_place(ptr, config, family);
            Box::from_raw(ptr)
        }
    }

    #[inline(always)]
    pub fn trace(&self) -> &TraceRing<TRACE_CAPACITY> {
        &self.trace
    }

    #[inline(always)]
    pub fn counters(&self) -> &EventCounters {
        &self.counters
    }

    #[inline(always)]
    pub fn family(&self) -> &ChipFamily {
        &self.family
    }

    #[inline(always)]
    pub fn ignored_irqs(&self) -> &IrqMask {
        &self.ignored_irqs
    }

    #[inline(always)]
    pub fn demux_gpio(&self) -> bool {
        self.demux_gpio
    }

    #[inline(always)]
    pub fn polls(&self, kind: PollListKind) -> &PollList {
        match kind {
            PollListKind::Irq => &self.irq_polls,
            PollListKind::Trace => &self.trace_polls,
        }
    }

    #[inline(always)]
    pub fn ignore_addrs(&self) -> &IgnoreList {
        &self.ignore_addrs
    }

    #[inline(always)]
    pub fn trace_for_watch(&self) -> bool {
        self.trace_for_watch
    }

    #[inline(always)]
    pub fn debug(&self) -> &DebugConfig {
        &self.debug
    }

    #[inline(always)]
    pub(crate) fn last_clock(&self) -> &AtomicU32 {
        &self.last_clock
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            irqs: self.counters.irqs.load(Ordering::Relaxed),
            aborts: self.counters.aborts.load(Ordering::Relaxed),
            prefetches: self.counters.prefetches.load(Ordering::Relaxed),
            debug_aborts: self.counters.debug_aborts.load(Ordering::Relaxed),
            debug_prefetches: self.counters.debug_prefetches.load(Ordering::Relaxed),
            overflows: self.trace.overflows(),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}
