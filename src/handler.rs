//! Exception-path producers.
//!
//! The relocated dispatch code calls one of these on every interrupt, data
//! abort and prefetch abort with the session state and the saved registers.
//! They run in modified-virtual-address mode with further exceptions masked:
//! everything they touch is reached through `state`, `regs`, the register
//! accessors and mapped controller blocks. No logging, no allocation.
//!
//! On ARM the entry points live in the `axirqwatch_irq` link section
//! together with the dispatch stubs, and everything they call is inlined
//! into them. The installer copies that section into the handler block, so
//! the running handlers never branch back into the image they were linked in.

use crate::chip::ChipFamily;
use crate::debug;
use crate::poll::{PollListKind, poll_all};
use crate::regs::{CpuRegs, MemoryBus};
use crate::state::{EventCounters, IrqRegs, SessionState};

/// What the dispatch code does after a producer returns.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Continue into the operating system's original handler.
    Chain = 0,
    /// The event belonged to the monitor; return from the exception.
    Handled = 1,
}

/// Interrupt delivery. Interrupts are always chained.
#[inline(always)]
pub fn irq<C: CpuRegs, B: MemoryBus>(
    state: &SessionState,
    _regs: &IrqRegs,
    cpu: &C,
    bus: &B,
) -> Disposition {
    EventCounters::bump(&state.counters().irqs);
    match state.family() {
        ChipFamily::XScale(blocks) => debug::irq(state, blocks, cpu, bus),
        ChipFamily::Generic => {
            let trace = state.trace();
            poll_all(trace, bus, 0, state.polls(PollListKind::Irq));
            poll_all(trace, bus, 0, state.polls(PollListKind::Trace));
        }
    }
    Disposition::Chain
}

/// Data abort delivery.
#[inline(always)]
pub fn data_abort<C: CpuRegs, B: MemoryBus>(
    state: &SessionState,
    regs: &IrqRegs,
    cpu: &C,
    bus: &B,
) -> Disposition {
    EventCounters::bump(&state.counters().aborts);
    match state.family() {
        ChipFamily::XScale(_) => debug::data_abort(state, regs, cpu, bus),
        ChipFamily::Generic => Disposition::Chain,
    }
}

/// Prefetch abort delivery.
#[inline(always)]
pub fn prefetch_abort<C: CpuRegs, B: MemoryBus>(
    state: &SessionState,
    regs: &IrqRegs,
    cpu: &C,
    bus: &B,
) -> Disposition {
    EventCounters::bump(&state.counters().prefetches);
    match state.family() {
        ChipFamily::XScale(_) => debug::prefetch_abort(state, regs, cpu, bus),
        ChipFamily::Generic => Disposition::Chain,
    }
}

// =============================================================================
// Entry points called by the relocated dispatch code
// =============================================================================

#[cfg(target_arch = "arm")]
mod entry {
    use super::*;
    use crate::regs::{DirectBus, XScaleRegs};

    /// # Safety
    /// `state` must point at the installed session state and `regs` at the
    /// register frame saved by the dispatch code.
    #[unsafe(no_mangle)]
    #[unsafe(link_section = "axirqwatch_irq")]
    pub unsafe extern "C" fn axirqwatch_irq_handler(
        state: *const SessionState,
        regs: *mut IrqRegs,
    ) -> u32 {
        let (state, regs) = unsafe { (&*state, &*regs) };
        irq(state, regs, &XScaleRegs, &DirectBus) as u32
    }

    /// # Safety
    /// See [`axirqwatch_irq_handler`].
    #[unsafe(no_mangle)]
    #[unsafe(link_section = "axirqwatch_irq")]
    pub unsafe extern "C" fn axirqwatch_abort_handler(
        state: *const SessionState,
        regs: *mut IrqRegs,
    ) -> u32 {
        let (state, regs) = unsafe { (&*state, &*regs) };
        data_abort(state, regs, &XScaleRegs, &DirectBus) as u32
    }

    /// # Safety
    /// See [`axirqwatch_irq_handler`].
    #[unsafe(no_mangle)]
    #[unsafe(link_section = "axirqwatch_irq")]
    pub unsafe extern "C" fn axirqwatch_prefetch_handler(
        state: *const SessionState,
        regs: *mut IrqRegs,
    ) -> u32 {
        let (state, regs) = unsafe { (&*state, &*regs) };
        prefetch_abort(state, regs, &XScaleRegs, &DirectBus) as u32
    }
}

#[cfg(target_arch = "arm")]
pub use entry::{axirqwatch_abort_handler, axirqwatch_irq_handler, axirqwatch_prefetch_handler};
