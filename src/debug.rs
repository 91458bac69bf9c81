//! Hardware-debug state machine for Intel XScale cores.
//!
//! Programs the data watchpoint (DBR0/DBR1/DBCON) and instruction breakpoint
//! (IBCR0/IBCR1) registers, and implements the exception-context side of
//! debug events:
//!
//! - data aborts raised by the watchpoint decode the faulting load/store and
//!   record both operand registers;
//! - prefetch aborts raised by an instruction breakpoint toggle the
//!   breakpoint between its primary and re-arm address, giving a
//!   break, single-step, re-break cycle;
//! - interrupts demultiplex the interrupt and GPIO controllers and notice
//!   when the host has reset the debug/performance unit behind our back.
//!
//! Breakpoint state is `Disarmed` until [`arm`] runs and returns there on
//! [`disarm`] or when a breakpoint fires at an address nobody configured.

use core::sync::atomic::Ordering;

use crate::chip::XScaleBlocks;
use crate::config::SessionConfig;
use crate::handler::Disposition;
use crate::poll::{PollListKind, poll_all};
use crate::regs::{CpuRegs, MemoryBus};
use crate::state::{EventCounters, IrqRegs, NR_GPIO_IRQS, RegisterView, START_GPIO_IRQS, SessionState};
use crate::trace::TraceTag;

/// FSR bit set when an abort was raised by the debug unit.
pub const FSR_DEBUG_EVENT: u32 = 1 << 9;
/// DBCON: DBR1 is a mask for DBR0 rather than a second address.
pub const DBCON_MASK_MODE: u32 = 1 << 8;
/// DCSR global debug enable.
pub const DCSR_GLOBAL_ENABLE: u32 = 1 << 31;
/// IBCR enable bit.
pub const IBCR_ENABLE: u32 = 1;
/// Saved PC minus this is the faulting instruction of a data abort.
pub const DATA_ABORT_PC_OFFSET: u32 = 8;
/// Saved PC minus this is the faulting instruction of a prefetch abort.
pub const PREFETCH_PC_OFFSET: u32 = 4;

const EVTSEL_NO_EVENTS: u32 = 0xffff_ffff;
const PMNC_ENABLE_AND_RESET: u32 = 0xf;

// Addresses in the current process slot need the PID relocated in.
const PROCESS_SLOT_LIMIT: u32 = 0x01ff_ffff;
const PID_MASK: u32 = 0xfe00_0000;

// Interrupt controller registers.
const ICIP: u32 = 0x00;
const ICMR: u32 = 0x04;
const ICIP2: u32 = 0x9c;
const ICMR2: u32 = 0xa0;
/// Primary source raised for any GPIO edge above GPIO1.
const GPIO_SUMMARY_IRQ: u32 = 10;
// GPIO edge detect status registers.
const GEDR0: u32 = 0x48;
const GEDR1: u32 = 0x4c;
const GEDR2: u32 = 0x50;
const GEDR3: u32 = 0x148;

/// Register indices reported when a breakpoint fires at an unknown address.
const FALLBACK_REGS: (u32, u32) = (0, 1);

/// A previous clock reading above `u32::MAX - CCNT_WRAP_WINDOW` may wrap
/// before the next interrupt, so a lower reading after it is not a reset.
pub const CCNT_WRAP_WINDOW: u32 = 0x1000_0000;

/// Access type matched by a data watchpoint.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchKind {
    Store = 1,
    #[default]
    LoadStore = 2,
    Load = 3,
}

impl WatchKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Store),
            2 => Some(Self::LoadStore),
            3 => Some(Self::Load),
            _ => None,
        }
    }
}

/// What DBR1 is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchExtra {
    #[default]
    None,
    /// DBR1 masks DBR0, watching a range.
    Mask(u32),
    /// DBR1 watches a second, independent address.
    Second { addr: u32, kind: WatchKind },
}

/// Data watchpoint configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchpoint {
    pub addr: u32,
    pub kind: WatchKind,
    pub extra: WatchExtra,
}

/// Instruction breakpoint with single-step re-arm.
///
/// When `addr` fires the breakpoint moves to `rearm`; when `rearm` fires it
/// moves back to `addr`. `reg1`/`reg2` are reported on every hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsnBreakpoint {
    pub addr: u32,
    pub rearm: u32,
    pub reg1: u32,
    pub reg2: u32,
}

impl InsnBreakpoint {
    /// A missing re-arm address defaults to the next instruction.
    pub fn new(addr: u32, rearm: Option<u32>, reg1: u32, reg2: u32) -> Self {
        Self {
            addr,
            rearm: rearm.unwrap_or(addr.wrapping_add(4)),
            reg1,
            reg2,
        }
    }
}

/// How an interrupt notices that the host reset the debug/performance unit.
///
/// The host's behaviour here was observed rather than documented, so the
/// predicate is configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetDetect {
    /// DBCON no longer holds the programmed value.
    #[default]
    DebugControlCleared,
    /// The clock counter reads lower than at the previous interrupt.
    ///
    /// CCNT wraps on its own every few seconds. A lower reading that follows
    /// one within [`CCNT_WRAP_WINDOW`] of the top is taken as a wrap, so a
    /// host reset that lands in that window goes unnoticed.
    CounterWentBackwards,
    /// Never re-arm.
    Never,
}

/// Debug register values for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugConfig {
    pub dbr0: u32,
    pub dbr1: u32,
    pub dbcon: u32,
    pub breakpoints: [Option<InsnBreakpoint>; 2],
    pub reset_detect: ResetDetect,
}

const fn dbcon_e0(kind: WatchKind) -> u32 {
    kind as u32 & 0x3
}

const fn dbcon_e1(kind: WatchKind) -> u32 {
    (kind as u32 & 0x3) << 2
}

impl DebugConfig {
    pub fn from_config(config: &SessionConfig) -> Self {
        let mut cfg = Self {
            breakpoints: config.breakpoints,
            reset_detect: config.reset_detect,
            ..Self::default()
        };
        if let Some(wp) = config.watchpoint {
            cfg.dbr0 = wp.addr;
            cfg.dbcon |= dbcon_e0(wp.kind);
            match wp.extra {
                WatchExtra::None => {}
                WatchExtra::Mask(mask) => {
                    cfg.dbr1 = mask;
                    cfg.dbcon |= DBCON_MASK_MODE;
                }
                WatchExtra::Second { addr, kind } => {
                    cfg.dbr1 = addr;
                    cfg.dbcon |= dbcon_e1(kind);
                }
            }
        }
        cfg
    }

    #[inline(always)]
    pub fn has_watchpoint(&self) -> bool {
        self.dbcon != 0
    }

    #[inline(always)]
    pub fn has_breakpoints(&self) -> bool {
        self.breakpoints.iter().any(Option::is_some)
    }

    /// Whether arming programs any debug register at all.
    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.has_watchpoint() || self.has_breakpoints()
    }
}

// =============================================================================
// Register programming
// =============================================================================

#[inline(always)]
fn set_ibcr<C: CpuRegs>(cpu: &C, index: usize, val: u32) {
    if index == 0 {
        cpu.set_ibcr0(val);
    } else {
        cpu.set_ibcr1(val);
    }
}

/// Start the clock counter and program every configured watchpoint and
/// breakpoint.
#[inline(always)]
pub fn arm<C: CpuRegs>(cpu: &C, cfg: &DebugConfig) {
    cpu.set_evtsel(EVTSEL_NO_EVENTS);
    cpu.set_inten(0);
    cpu.set_pmnc(PMNC_ENABLE_AND_RESET);

    if !cfg.is_active() {
        return;
    }
    cpu.set_dbcon(0);
    cpu.set_dbr0(cfg.dbr0);
    cpu.set_dbr1(cfg.dbr1);
    cpu.set_dbcon(cfg.dbcon);
    cpu.set_dcsr(DCSR_GLOBAL_ENABLE);
    for (index, bp) in cfg.breakpoints.iter().enumerate() {
        if let Some(bp) = bp {
            set_ibcr(cpu, index, bp.addr | IBCR_ENABLE);
        }
    }
}

/// Clear every debug register and stop the performance monitor. Safe to
/// call when nothing was armed.
#[inline(always)]
pub fn disarm<C: CpuRegs>(cpu: &C) {
    cpu.set_ibcr0(0);
    cpu.set_ibcr1(0);
    cpu.set_dbcon(0);
    cpu.set_dcsr(0);
    cpu.set_pmnc(0);
}

/// Run `f` with the data watchpoint disabled so sampling memory cannot
/// re-trigger it.
#[inline(always)]
pub fn with_debug_paused<C: CpuRegs, R>(cpu: &C, dbcon: u32, f: impl FnOnce() -> R) -> R {
    cpu.set_dbcon(0);
    let ret = f();
    cpu.set_dbcon(dbcon);
    ret
}

/// Convert a PC in the current process slot to its modified virtual address.
#[inline(always)]
pub fn translate_pc<C: CpuRegs>(cpu: &C, pc: u32) -> u32 {
    if pc <= PROCESS_SLOT_LIMIT {
        pc | (cpu.pid() & PID_MASK)
    } else {
        pc
    }
}

// =============================================================================
// Instruction decoding
// =============================================================================

/// Destination (load) or source (store) register of a load/store.
#[inline(always)]
pub const fn insn_rd(insn: u32) -> u32 {
    (insn >> 12) & 0xf
}

/// Base register of a load/store.
#[inline(always)]
pub const fn insn_rn(insn: u32) -> u32 {
    (insn >> 16) & 0xf
}

/// Assembler mnemonic for the load/store forms a watchpoint can trip on.
pub fn insn_name(insn: u32) -> &'static str {
    let is_load = insn & (1 << 20) != 0;
    if insn & 0x0c00_0000 == 0x0400_0000 {
        let byte = insn & (1 << 22) != 0;
        return match (is_load, byte) {
            (true, true) => "ldrb",
            (true, false) => "ldr",
            (false, true) => "strb",
            (false, false) => "str",
        };
    }
    if insn & 0x0e00_0000 == 0 {
        return match (is_load, insn & 0xf0) {
            (true, 0xb0) => "ldrh",
            (true, 0xd0) => "ldrsb",
            (true, 0xf0) => "ldrsh",
            (false, 0xb0) => "strh",
            (false, 0x90) => "swp?",
            _ => "?",
        };
    }
    "?"
}

// =============================================================================
// Exception-context delivery
// =============================================================================

/// Whether `clock` following `last` means the counter restarted rather than
/// wrapped.
#[inline(always)]
pub const fn counter_went_backwards(last: u32, clock: u32) -> bool {
    clock < last && last <= u32::MAX - CCNT_WRAP_WINDOW
}

#[inline(always)]
fn counter_was_reset<C: CpuRegs>(state: &SessionState, cpu: &C, clock: u32) -> bool {
    let cfg = state.debug();
    match cfg.reset_detect {
        ResetDetect::DebugControlCleared => cpu.dbcon() != cfg.dbcon,
        ResetDetect::CounterWentBackwards => {
            counter_went_backwards(state.last_clock().load(Ordering::Relaxed), clock)
        }
        ResetDetect::Never => false,
    }
}

/// Interrupt delivery: trace pending sources and run both poll lists.
#[inline(always)]
pub(crate) fn irq<C: CpuRegs, B: MemoryBus>(
    state: &SessionState,
    blocks: &XScaleBlocks,
    cpu: &C,
    bus: &B,
) {
    let cfg = state.debug();
    let trace = state.trace();
    let mut clock = cpu.ccnt();

    if counter_was_reset(state, cpu, clock) {
        trace.append(TraceTag::Resumed, [0; 5]);
        arm(cpu, cfg);
        clock = 0;
    }
    state.last_clock().store(clock, Ordering::Relaxed);

    with_debug_paused(cpu, cfg.dbcon, || {
        let ic = &blocks.irq_ctrl;
        let pending = ic.read(bus, ICIP) & ic.read(bus, ICMR);
        let pending2 = ic.read(bus, ICIP2) & ic.read(bus, ICMR2);
        let ignored = state.ignored_irqs();
        for irq in 0..START_GPIO_IRQS {
            let word = if irq < 32 { pending } else { pending2 };
            let bit = word & (1 << (irq % 32)) != 0;
            if bit && !ignored.contains(irq) {
                trace.append(TraceTag::Irq, [clock, irq, 0, 0, 0]);
            }
        }

        if pending & (1 << GPIO_SUMMARY_IRQ) != 0 && state.demux_gpio() {
            let gpio = &blocks.gpio_ctrl;
            let edges = [
                gpio.read(bus, GEDR0),
                gpio.read(bus, GEDR1),
                gpio.read(bus, GEDR2),
                gpio.read(bus, GEDR3),
            ];
            for line in 0..NR_GPIO_IRQS {
                let irq = START_GPIO_IRQS + line;
                let word = edges[(line / 32) as usize & 3];
                let bit = word & (1 << (line % 32)) != 0;
                if bit && !ignored.contains(irq) {
                    trace.append(TraceTag::Irq, [clock, irq, 0, 0, 0]);
                }
            }
        }

        poll_all(trace, bus, clock, state.polls(PollListKind::Irq));
        poll_all(trace, bus, clock, state.polls(PollListKind::Trace));
    });
}

/// Data abort delivery: record the load/store that tripped the watchpoint.
#[inline(always)]
pub(crate) fn data_abort<C: CpuRegs, B: MemoryBus>(
    state: &SessionState,
    regs: &IrqRegs,
    cpu: &C,
    bus: &B,
) -> Disposition {
    if cpu.fsr() & FSR_DEBUG_EVENT == 0 {
        return Disposition::Chain;
    }
    EventCounters::bump(&state.counters().debug_aborts);

    let cfg = state.debug();
    let trace = state.trace();
    let clock = cpu.ccnt();

    let matched = with_debug_paused(cpu, cfg.dbcon, || {
        poll_all(trace, bus, clock, state.polls(PollListKind::Trace))
    });
    if state.trace_for_watch() && matched == 0 {
        return Disposition::Handled;
    }

    let pc = translate_pc(cpu, regs.old_pc.wrapping_sub(DATA_ABORT_PC_OFFSET));
    if state.ignore_addrs().contains(pc) {
        return Disposition::Handled;
    }

    let insn = bus.read32(pc);
    let mut view = RegisterView::new(regs, cpu);
    let rd = view.get(insn_rd(insn));
    let rn = view.get(insn_rn(insn));
    trace.append(TraceTag::MemAccess, [clock, pc, insn, rd, rn]);
    Disposition::Handled
}

/// Prefetch abort delivery: cycle the breakpoint that fired.
#[inline(always)]
pub(crate) fn prefetch_abort<C: CpuRegs, B: MemoryBus>(
    state: &SessionState,
    regs: &IrqRegs,
    cpu: &C,
    bus: &B,
) -> Disposition {
    if cpu.fsr() & FSR_DEBUG_EVENT == 0 {
        return Disposition::Chain;
    }
    EventCounters::bump(&state.counters().debug_prefetches);

    let cfg = state.debug();
    let trace = state.trace();
    let clock = cpu.ccnt();
    let pc = translate_pc(cpu, regs.old_pc.wrapping_sub(PREFETCH_PC_OFFSET));

    let mut hit = None;
    for (index, bp) in cfg.breakpoints.iter().enumerate() {
        let Some(bp) = bp else { continue };
        if bp.addr == pc {
            set_ibcr(cpu, index, bp.rearm | IBCR_ENABLE);
        } else if bp.rearm == pc {
            set_ibcr(cpu, index, bp.addr | IBCR_ENABLE);
        } else {
            continue;
        }
        hit = Some((bp.reg1, bp.reg2));
        break;
    }
    let (reg1, reg2) = hit.unwrap_or_else(|| {
        EventCounters::bump(&state.counters().errors);
        cpu.set_ibcr0(0);
        cpu.set_ibcr1(0);
        FALLBACK_REGS
    });

    let mut view = RegisterView::new(regs, cpu);
    let (v1, v2) = (view.get(reg1), view.get(reg2));
    trace.append(TraceTag::InsnTrace, [clock, pc, v1, v2, 0]);

    with_debug_paused(cpu, cfg.dbcon, || {
        poll_all(trace, bus, clock, state.polls(PollListKind::Trace))
    });
    Disposition::Handled
}
