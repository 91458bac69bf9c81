//! Register and primitive access layer.
//!
//! Typed accessors for the CPU/coprocessor registers used by the monitor and
//! plain volatile reads for memory-mapped controller blocks.
//!
//! Every accessor is a short, non-suspending instruction sequence. Several of
//! them run from exception context before normal addressing is restored, so
//! nothing in here allocates, logs, or touches session state.

/// IRQ disable bit in the program status registers.
pub const PSR_IRQ_DISABLE: u32 = 1 << 7;
/// FIQ disable bit in the program status registers.
pub const PSR_FIQ_DISABLE: u32 = 1 << 6;
/// Processor mode field.
pub const PSR_MODE_MASK: u32 = 0x1f;
/// User mode.
pub const MODE_USER: u32 = 0x10;
/// System mode (shares the user register bank).
pub const MODE_SYSTEM: u32 = 0x1f;

/// CPU and coprocessor registers needed by the handlers and the installer.
///
/// Setters take `&self`: implementations are register accessors, not
/// owners of state.
pub trait CpuRegs {
    /// Clock counter (CCNT, performance monitor).
    fn ccnt(&self) -> u32;
    /// Debug control register (DBCON).
    fn dbcon(&self) -> u32;
    fn set_dbcon(&self, val: u32);
    /// Data breakpoint address register 0.
    fn set_dbr0(&self, val: u32);
    /// Data breakpoint address/mask register 1.
    fn set_dbr1(&self, val: u32);
    /// Instruction breakpoint register 0.
    fn set_ibcr0(&self, val: u32);
    /// Instruction breakpoint register 1.
    fn set_ibcr1(&self, val: u32);
    /// Debug control and status register.
    fn set_dcsr(&self, val: u32);
    /// Performance monitor event selection.
    fn set_evtsel(&self, val: u32);
    /// Performance monitor interrupt enable.
    fn set_inten(&self, val: u32);
    /// Performance monitor control.
    fn set_pmnc(&self, val: u32);
    /// Fault status register.
    fn fsr(&self) -> u32;
    /// Process id register (fast context switch extension).
    fn pid(&self) -> u32;
    /// Saved program status register of the current exception mode.
    fn spsr(&self) -> u32;
    fn cpsr(&self) -> u32;
    /// Write the control field (mode and interrupt mask bits) of the CPSR.
    fn set_cpsr_c(&self, val: u32);
    /// Fetch r13/r14 from the register bank of processor mode `mode`.
    fn banked_sp_lr(&self, mode: u32) -> [u32; 2];
}

/// Memory access in the target's 32-bit address space.
///
/// The exception path only reads; `write32` is used by the installer to
/// patch vector literals.
pub trait MemoryBus {
    fn read8(&self, addr: u32) -> u8;
    fn read16(&self, addr: u32) -> u16;
    fn read32(&self, addr: u32) -> u32;
    fn write32(&self, addr: u32, val: u32);
}

/// A mapped memory-mapped controller block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mmio {
    base: u32,
}

impl Mmio {
    pub const fn new(base: u32) -> Self {
        Self { base }
    }

    pub const fn base(&self) -> u32 {
        self.base
    }

    /// Read the 32-bit register at `offset` bytes into the block.
    #[inline(always)]
    pub fn read<B: MemoryBus>(&self, bus: &B, offset: u32) -> u32 {
        bus.read32(self.base.wrapping_add(offset))
    }
}

/// Masks IRQ and FIQ for its lifetime.
pub struct IrqGuard<'a, C: CpuRegs> {
    cpu: &'a C,
    saved: u32,
}

impl<'a, C: CpuRegs> IrqGuard<'a, C> {
    pub fn new(cpu: &'a C) -> Self {
        let saved = cpu.cpsr();
        cpu.set_cpsr_c(saved | PSR_IRQ_DISABLE | PSR_FIQ_DISABLE);
        Self { cpu, saved }
    }
}

impl<C: CpuRegs> Drop for IrqGuard<'_, C> {
    fn drop(&mut self) {
        self.cpu.set_cpsr_c(self.saved);
    }
}

/// Direct volatile memory access.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectBus;

impl MemoryBus for DirectBus {
    #[inline(always)]
    fn read8(&self, addr: u32) -> u8 {
        unsafe { core::ptr::read_volatile(addr as usize as *const u8) }
    }

    #[inline(always)]
    fn read16(&self, addr: u32) -> u16 {
        unsafe { core::ptr::read_volatile(addr as usize as *const u16) }
    }

    #[inline(always)]
    fn read32(&self, addr: u32) -> u32 {
        unsafe { core::ptr::read_volatile(addr as usize as *const u32) }
    }

    #[inline(always)]
    fn write32(&self, addr: u32, val: u32) {
        unsafe { core::ptr::write_volatile(addr as usize as *mut u32, val) }
    }
}

// =============================================================================
// XScale coprocessor access (ARM targets)
// =============================================================================

#[cfg(target_arch = "arm")]
pub use xscale::XScaleRegs;

#[cfg(target_arch = "arm")]
mod xscale {
    use super::{CpuRegs, MODE_SYSTEM, MODE_USER, PSR_FIQ_DISABLE, PSR_IRQ_DISABLE, PSR_MODE_MASK};
    use core::arch::asm;

    macro_rules! cp_read {
        ($name:ident, $cp:literal, $crn:literal, $crm:literal, $op2:literal) => {
            #[inline(always)]
            fn $name(&self) -> u32 {
                let value: u32;
                unsafe {
                    asm!(
                        concat!("mrc ", $cp, ", 0, {value}, ", $crn, ", ", $crm, ", ", $op2),
                        value = out(reg) value,
                        options(nomem, nostack, preserves_flags),
                    );
                }
                value
            }
        };
    }

    macro_rules! cp_write {
        ($name:ident, $cp:literal, $crn:literal, $crm:literal, $op2:literal) => {
            #[inline(always)]
            fn $name(&self, val: u32) {
                unsafe {
                    asm!(
                        concat!("mcr ", $cp, ", 0, {value}, ", $crn, ", ", $crm, ", ", $op2),
                        value = in(reg) val,
                        options(nostack, preserves_flags),
                    );
                }
            }
        };
    }

    /// Register accessors for Intel XScale cores.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct XScaleRegs;

    impl CpuRegs for XScaleRegs {
        cp_read!(ccnt, "p14", "c1", "c1", "0");
        cp_read!(dbcon, "p15", "c14", "c4", "0");
        cp_write!(set_dbcon, "p15", "c14", "c4", "0");
        cp_write!(set_dbr0, "p15", "c14", "c0", "0");
        cp_write!(set_dbr1, "p15", "c14", "c3", "0");
        cp_write!(set_ibcr0, "p15", "c14", "c8", "0");
        cp_write!(set_ibcr1, "p15", "c14", "c9", "0");
        cp_write!(set_dcsr, "p14", "c10", "c0", "0");
        cp_write!(set_evtsel, "p14", "c8", "c1", "0");
        cp_write!(set_inten, "p14", "c4", "c1", "0");
        cp_write!(set_pmnc, "p14", "c0", "c1", "0");
        cp_read!(fsr, "p15", "c5", "c0", "0");
        cp_read!(pid, "p15", "c13", "c0", "0");

        #[inline(always)]
        fn spsr(&self) -> u32 {
            let value: u32;
            unsafe { asm!("mrs {}, spsr", out(reg) value, options(nomem, nostack, preserves_flags)) };
            value
        }

        #[inline(always)]
        fn cpsr(&self) -> u32 {
            let value: u32;
            unsafe { asm!("mrs {}, cpsr", out(reg) value, options(nomem, nostack, preserves_flags)) };
            value
        }

        #[inline(always)]
        fn set_cpsr_c(&self, val: u32) {
            unsafe { asm!("msr cpsr_c, {}", in(reg) val, options(nostack)) };
        }

        #[inline(always)]
        fn banked_sp_lr(&self, mode: u32) -> [u32; 2] {
            let mut mode = mode & PSR_MODE_MASK;
            // Entering user mode from here would be one-way.
            if mode == MODE_USER {
                mode = MODE_SYSTEM;
            }
            let target = mode | PSR_IRQ_DISABLE | PSR_FIQ_DISABLE;
            let (sp, lr): (u32, u32);
            unsafe {
                asm!(
                    "mrs {saved}, cpsr",
                    "msr cpsr_c, {target}",
                    "mov {sp}, r13",
                    "mov {lr}, r14",
                    "msr cpsr_c, {saved}",
                    saved = out(reg) _,
                    target = in(reg) target,
                    sp = out(reg) sp,
                    lr = out(reg) lr,
                    options(nomem, nostack),
                );
            }
            [sp, lr]
        }
    }
}
