//! Exception dispatch stubs (ARM).
//!
//! Everything in the `axirqwatch_irq` section is copied into the handler
//! block as one image: the [`AsmVars`] record, the three stubs below and the
//! `axirqwatch_*_handler` entry points from [`crate::handler`]. Branches
//! inside the section are pc-relative, so the copy runs at any address.
//!
//! Each stub saves r0-r12 and lr on the interrupted mode's stack, switches
//! to its own stack in the block and calls its handler with the session
//! state and the saved frame ([`IrqRegs`](crate::state::IrqRegs) layout).
//! A `Chain` result restores the frame and jumps to the original handler; a
//! `Handled` result returns from the exception.
//!
//! The stacks end where the session state begins: `state_mva` is the top of
//! the irq stack, the abort stack ends one stack below it and the prefetch
//! stack two below.

use core::arch::global_asm;

use crate::chain::{AsmVars, DispatchImage, STACK_SIZE};

global_asm!(
    ".pushsection axirqwatch_irq, \"ax\", %progbits",
    ".arm",
    ".balign 4",
    ".global axirqwatch_asm_vars",
    "axirqwatch_asm_vars:",
    "axirqwatch_state_mva: .word 0",
    "axirqwatch_orig_irq: .word 0",
    "axirqwatch_orig_abort: .word 0",
    "axirqwatch_orig_prefetch: .word 0",
    //
    ".global axirqwatch_irq_entry",
    "axirqwatch_irq_entry:",
    "    stmdb sp!, {{r0-r12, lr}}",
    "    mov r4, sp",
    "    mov r1, sp",
    "    ldr r0, axirqwatch_state_mva",
    "    mov sp, r0",
    "    bl axirqwatch_irq_handler",
    "    mov sp, r4",
    "    cmp r0, #0",
    "    ldmia sp!, {{r0-r12, lr}}",
    "    ldreq pc, axirqwatch_orig_irq",
    "    subs pc, lr, #4",
    //
    ".global axirqwatch_abort_entry",
    "axirqwatch_abort_entry:",
    "    stmdb sp!, {{r0-r12, lr}}",
    "    mov r4, sp",
    "    mov r1, sp",
    "    ldr r0, axirqwatch_state_mva",
    "    sub sp, r0, #{one_stack}",
    "    bl axirqwatch_abort_handler",
    "    mov sp, r4",
    "    cmp r0, #0",
    "    ldmia sp!, {{r0-r12, lr}}",
    "    ldreq pc, axirqwatch_orig_abort",
    // Debug data aborts are taken after the access completed.
    "    subs pc, lr, #4",
    //
    ".global axirqwatch_prefetch_entry",
    "axirqwatch_prefetch_entry:",
    "    stmdb sp!, {{r0-r12, lr}}",
    "    mov r4, sp",
    "    mov r1, sp",
    "    ldr r0, axirqwatch_state_mva",
    "    sub sp, r0, #{two_stacks}",
    "    bl axirqwatch_prefetch_handler",
    "    mov sp, r4",
    "    cmp r0, #0",
    "    ldmia sp!, {{r0-r12, lr}}",
    "    ldreq pc, axirqwatch_orig_prefetch",
    // Re-execute the instruction; its breakpoint has moved on.
    "    subs pc, lr, #4",
    ".popsection",
    one_stack = const STACK_SIZE,
    two_stacks = const 2 * STACK_SIZE,
);

unsafe extern "C" {
    // Provided by the linker for sections named like C identifiers.
    static __start_axirqwatch_irq: u8;
    static __stop_axirqwatch_irq: u8;

    static axirqwatch_asm_vars: AsmVars;
    fn axirqwatch_irq_entry();
    fn axirqwatch_abort_entry();
    fn axirqwatch_prefetch_entry();
}

/// The linked handler section as a dispatch image.
pub(crate) fn image() -> Option<DispatchImage> {
    let (code, vars) = unsafe {
        let start = &raw const __start_axirqwatch_irq;
        let stop = &raw const __stop_axirqwatch_irq;
        let len = (stop as usize).checked_sub(start as usize)?;
        (
            core::slice::from_raw_parts(start, len),
            &raw const axirqwatch_asm_vars as usize,
        )
    };
    DispatchImage::from_symbols(
        code,
        vars,
        axirqwatch_irq_entry as usize,
        axirqwatch_abort_entry as usize,
        axirqwatch_prefetch_entry as usize,
    )
}
