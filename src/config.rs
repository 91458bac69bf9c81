//! Watch configuration registered before a session.
//!
//! The command layer sets values piecemeal on the process-wide
//! [`WatchSettings`]; a session takes one immutable [`SessionConfig`]
//! snapshot when it starts and never looks at the settings again.

use alloc::vec::Vec;

use axerrno::AxResult;
use spin::{Mutex, MutexGuard};

use crate::debug::{InsnBreakpoint, ResetDetect, Watchpoint};
use crate::poll::{AccessWidth, PollDescriptor, PollListKind};
use crate::state::{IrqMask, MAX_IGNORE_ADDRS};

/// Entries per watch list.
pub const MAX_WATCHES: usize = 16;
/// Number of instruction breakpoint registers.
pub const MAX_BREAKPOINTS: usize = 2;
/// Highest register index a breakpoint may report.
const MAX_REG_INDEX: u32 = 15;

/// Configuration snapshot consumed by one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub ignored_irqs: IrqMask,
    pub demux_gpio: bool,
    pub ignore_addrs: Vec<u32>,
    pub trace_for_watch: bool,
    pub watchpoint: Option<Watchpoint>,
    pub breakpoints: [Option<InsnBreakpoint>; MAX_BREAKPOINTS],
    pub reset_detect: ResetDetect,
    pub irq_watches: Vec<PollDescriptor>,
    pub trace_watches: Vec<PollDescriptor>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        WatchSettings::new().snapshot()
    }
}

/// Mutable watch settings.
#[derive(Debug)]
pub struct WatchSettings {
    ignored_irqs: IrqMask,
    demux_gpio: bool,
    ignore_addrs: Vec<u32>,
    trace_for_watch: bool,
    watchpoint: Option<Watchpoint>,
    breakpoints: [Option<InsnBreakpoint>; MAX_BREAKPOINTS],
    reset_detect: ResetDetect,
    irq_watches: Vec<PollDescriptor>,
    trace_watches: Vec<PollDescriptor>,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchSettings {
    pub const fn new() -> Self {
        Self {
            ignored_irqs: IrqMask::new(),
            demux_gpio: true,
            ignore_addrs: Vec::new(),
            trace_for_watch: false,
            watchpoint: None,
            breakpoints: [None; MAX_BREAKPOINTS],
            reset_detect: ResetDetect::DebugControlCleared,
            irq_watches: Vec::new(),
            trace_watches: Vec::new(),
        }
    }

    // =========================================================================
    // Interrupt filtering
    // =========================================================================

    pub fn ignore_irq(&mut self, irq: u32) -> AxResult {
        if !self.ignored_irqs.insert(irq) {
            return axerrno::ax_err!(InvalidInput, "irq number out of range");
        }
        Ok(())
    }

    pub fn unignore_irq(&mut self, irq: u32) {
        self.ignored_irqs.remove(irq);
    }

    pub fn ignored_irqs(&self) -> &IrqMask {
        &self.ignored_irqs
    }

    pub fn set_demux_gpio(&mut self, enabled: bool) {
        self.demux_gpio = enabled;
    }

    // =========================================================================
    // Data watchpoint
    // =========================================================================

    pub fn add_ignore_addr(&mut self, pc: u32) -> AxResult {
        if self.ignore_addrs.len() >= MAX_IGNORE_ADDRS {
            return axerrno::ax_err!(NoMemory, "trace ignore list is full");
        }
        self.ignore_addrs.push(pc);
        Ok(())
    }

    pub fn clear_ignore_addrs(&mut self) {
        self.ignore_addrs.clear();
    }

    /// Only report data watchpoint hits when a trace-time poll matched.
    pub fn set_trace_for_watch(&mut self, enabled: bool) {
        self.trace_for_watch = enabled;
    }

    pub fn set_watchpoint(&mut self, watchpoint: Option<Watchpoint>) {
        self.watchpoint = watchpoint;
    }

    // =========================================================================
    // Instruction breakpoints
    // =========================================================================

    /// Configure breakpoint register `index`.
    pub fn set_breakpoint(&mut self, index: usize, bp: InsnBreakpoint) -> AxResult {
        if index >= MAX_BREAKPOINTS {
            return axerrno::ax_err!(InvalidInput, "no such breakpoint register");
        }
        if bp.reg1 > MAX_REG_INDEX || bp.reg2 > MAX_REG_INDEX {
            return axerrno::ax_err!(InvalidInput, "register index out of range");
        }
        self.breakpoints[index] = Some(bp);
        Ok(())
    }

    pub fn clear_breakpoint(&mut self, index: usize) {
        if let Some(slot) = self.breakpoints.get_mut(index) {
            *slot = None;
        }
    }

    pub fn set_reset_detect(&mut self, detect: ResetDetect) {
        self.reset_detect = detect;
    }

    // =========================================================================
    // Watch lists
    // =========================================================================

    fn list_mut(&mut self, kind: PollListKind) -> &mut Vec<PollDescriptor> {
        match kind {
            PollListKind::Irq => &mut self.irq_watches,
            PollListKind::Trace => &mut self.trace_watches,
        }
    }

    /// Append a watch and return its index in the list.
    pub fn add_watch(
        &mut self,
        kind: PollListKind,
        addr: u32,
        mask: Option<u32>,
        width_bits: u32,
        cmp_value: u32,
    ) -> AxResult<usize> {
        let Some(width) = AccessWidth::from_bits(width_bits) else {
            return axerrno::ax_err!(InvalidInput, "watch width must be 8, 16 or 32");
        };
        let list = self.list_mut(kind);
        if list.len() >= MAX_WATCHES {
            return axerrno::ax_err!(NoMemory, "watch list is full");
        }
        list.push(PollDescriptor::new(addr, width, mask, cmp_value));
        Ok(list.len() - 1)
    }

    pub fn clear_watches(&mut self, kind: PollListKind) {
        self.list_mut(kind).clear();
    }

    pub fn watches(&self, kind: PollListKind) -> &[PollDescriptor] {
        match kind {
            PollListKind::Irq => &self.irq_watches,
            PollListKind::Trace => &self.trace_watches,
        }
    }

    /// Immutable copy handed to a session.
    pub fn snapshot(&self) -> SessionConfig {
        SessionConfig {
            ignored_irqs: self.ignored_irqs,
            demux_gpio: self.demux_gpio,
            ignore_addrs: self.ignore_addrs.clone(),
            trace_for_watch: self.trace_for_watch,
            watchpoint: self.watchpoint,
            breakpoints: self.breakpoints,
            reset_detect: self.reset_detect,
            irq_watches: self.irq_watches.clone(),
            trace_watches: self.trace_watches.clone(),
        }
    }
}

static SETTINGS: Mutex<WatchSettings> = Mutex::new(WatchSettings::new());

/// Locked access to the process-wide watch settings.
pub fn settings() -> MutexGuard<'static, WatchSettings> {
    SETTINGS.lock()
}
