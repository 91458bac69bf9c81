//! Integration tests for the exception handler chain installer.

mod common;

use axerrno::AxError;
use axirqwatch::chain::{
    AsmVars, CODE_OFFSET, DispatchImage, HandlerChain, InstallerState, STATE_OFFSET, VectorSlot,
    block_size,
};
use axirqwatch::config::SessionConfig;
use axirqwatch::debug::{InsnBreakpoint, WatchExtra, WatchKind, Watchpoint};
use axirqwatch::handler::Disposition;
use axirqwatch::regs::PSR_IRQ_DISABLE;
use axirqwatch::state::IrqRegs;
use common::{
    BLOCK_MVA_BASE, DISPATCH_CODE, MockPlatform, TEST_IMAGE, VECTOR_MAP, host_handler,
    literal_addr,
};

fn original_targets() -> [u32; 3] {
    VectorSlot::ALL.map(host_handler)
}

fn debug_config() -> SessionConfig {
    SessionConfig {
        watchpoint: Some(Watchpoint {
            addr: 0xa000_0100,
            kind: WatchKind::LoadStore,
            extra: WatchExtra::Mask(0xff),
        }),
        breakpoints: [Some(InsnBreakpoint::new(0x8000_1000, None, 0, 1)), None],
        ..SessionConfig::default()
    }
}

// =============================================================================
// Locate
// =============================================================================

#[test]
fn test_locate_finds_trampoline_literals() {
    let platform = MockPlatform::new();
    let mut chain = HandlerChain::new(&platform, &TEST_IMAGE);
    chain.locate().unwrap();
    assert_eq!(chain.installer_state(), InstallerState::Located);
    assert_eq!(platform.allocs.get(), 0);
}

#[test]
fn test_unknown_vector_shape_aborts_before_allocation() {
    let platform = MockPlatform::new();
    // b <somewhere> in the data abort slot
    platform.bus.poke(VECTOR_MAP + VectorSlot::DataAbort.offset(), 0xea00_003e);

    let err = HandlerChain::install(&platform, &TEST_IMAGE, &SessionConfig::default())
        .err()
        .unwrap();
    assert!(matches!(err, AxError::Unsupported));
    assert_eq!(platform.allocs.get(), 0);
    assert_eq!(platform.flushes.get(), 0);
    assert_eq!(platform.vector_targets(), original_targets());
}

// =============================================================================
// Allocate
// =============================================================================

#[test]
fn test_allocation_failure_leaves_vectors_untouched() {
    let platform = MockPlatform::new();
    platform.fail_alloc.set(true);

    let err = HandlerChain::install(&platform, &TEST_IMAGE, &SessionConfig::default())
        .err()
        .unwrap();
    assert!(matches!(err, AxError::NoMemory));
    assert_eq!(platform.frees.get(), 0);
    assert_eq!(platform.flushes.get(), 0);
    assert_eq!(platform.vector_targets(), original_targets());
}

#[test]
fn test_allocate_builds_block() {
    let platform = MockPlatform::new();
    let mut chain = HandlerChain::new(&platform, &TEST_IMAGE);
    chain.locate().unwrap();
    chain.allocate(&debug_config()).unwrap();
    assert_eq!(chain.installer_state(), InstallerState::Allocated);
    assert_eq!(platform.allocs.get(), 1);

    let vars = chain.vars().unwrap();
    assert_eq!(vars.state_mva, BLOCK_MVA_BASE + STATE_OFFSET as u32);
    assert_eq!(vars.orig_irq, 0);

    let state = chain.state().unwrap();
    assert!(state.trace().is_empty());
    assert_eq!(state.snapshot().irqs, 0);
    assert_eq!(state.debug().dbr0, 0xa000_0100);
    // Nothing redirected yet.
    assert_eq!(platform.vector_targets(), original_targets());
}

#[test]
fn test_allocate_copies_image_and_fills_its_vars() {
    let platform = MockPlatform::new();
    let chain = HandlerChain::install(&platform, &TEST_IMAGE, &SessionConfig::default()).unwrap();
    let code_mva = BLOCK_MVA_BASE + CODE_OFFSET as u32;
    let copied = platform.block_bytes(code_mva, DISPATCH_CODE.len()).unwrap();

    // Everything but the variables is the image, byte for byte.
    let vars = TEST_IMAGE.vars_offset..TEST_IMAGE.vars_offset + size_of::<AsmVars>();
    for (offset, (got, want)) in copied.iter().zip(DISPATCH_CODE.iter()).enumerate() {
        if !vars.contains(&offset) {
            assert_eq!(got, want, "byte {:#x}", offset);
        }
    }

    // The variables live in the copy, not in the linked image.
    let words: Vec<u32> = copied[vars]
        .chunks(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();
    assert_eq!(
        words,
        [
            BLOCK_MVA_BASE + STATE_OFFSET as u32,
            host_handler(VectorSlot::Irq),
            host_handler(VectorSlot::DataAbort),
            host_handler(VectorSlot::Prefetch),
        ]
    );
    assert_eq!(DISPATCH_CODE[TEST_IMAGE.vars_offset], TEST_IMAGE.vars_offset as u8 ^ 0xa5);

    // Every redirected vector lands inside the copied code.
    for slot in VectorSlot::ALL {
        let target = chain.entry_mva(slot).unwrap();
        assert!(target >= code_mva && target < code_mva + DISPATCH_CODE.len() as u32);
    }
}

#[test]
fn test_failure_after_allocation_releases_block() {
    let platform = MockPlatform::new();
    {
        let mut chain = HandlerChain::new(&platform, &TEST_IMAGE);
        chain.locate().unwrap();
        chain.allocate(&SessionConfig::default()).unwrap();
        assert_eq!(platform.live_blocks(), 1);
    }
    assert_eq!(platform.live_blocks(), 0);
    assert_eq!(platform.frees.get(), 1);
    assert_eq!(platform.vector_targets(), original_targets());
}

// =============================================================================
// Patch / Restore
// =============================================================================

#[test]
fn test_patch_redirects_vectors_into_block() {
    let platform = MockPlatform::new();
    let chain = HandlerChain::install(&platform, &TEST_IMAGE, &SessionConfig::default()).unwrap();
    assert_eq!(chain.installer_state(), InstallerState::Patched);

    for (slot, entry) in [
        (VectorSlot::Irq, TEST_IMAGE.irq_entry),
        (VectorSlot::DataAbort, TEST_IMAGE.abort_entry),
        (VectorSlot::Prefetch, TEST_IMAGE.prefetch_entry),
    ] {
        let expected = BLOCK_MVA_BASE + (CODE_OFFSET + entry) as u32;
        assert_eq!(platform.bus.peek(literal_addr(slot)), expected);
        assert_eq!(chain.entry_mva(slot), Some(expected));
    }

    let vars = chain.vars().unwrap();
    assert_eq!(vars.orig_irq, host_handler(VectorSlot::Irq));
    assert_eq!(vars.orig_abort, host_handler(VectorSlot::DataAbort));
    assert_eq!(vars.orig_prefetch, host_handler(VectorSlot::Prefetch));
    assert_eq!(platform.flushes.get(), 1);
    // Interrupt mask restored after patching.
    assert_eq!(platform.cpu.cpsr.get() & PSR_IRQ_DISABLE, 0);
}

#[test]
fn test_install_restore_round_trip() {
    let platform = MockPlatform::new();
    let before = platform.vector_targets();

    let mut chain = HandlerChain::install(&platform, &TEST_IMAGE, &SessionConfig::default()).unwrap();
    assert_ne!(platform.vector_targets(), before);

    chain.restore();
    assert_eq!(chain.installer_state(), InstallerState::Restored);
    assert_eq!(platform.vector_targets(), before);
    assert_eq!(platform.flushes.get(), 2);
    // Block stays readable until released.
    assert!(chain.state().is_some());

    chain.restore();
    assert_eq!(platform.flushes.get(), 2);
    assert_eq!(platform.vector_targets(), before);

    chain.release();
    assert_eq!(chain.installer_state(), InstallerState::Idle);
    assert_eq!(platform.frees.get(), 1);
    drop(chain);
    assert_eq!(platform.frees.get(), 1);
    assert_eq!(platform.live_blocks(), 0);
}

#[test]
fn test_drop_restores_and_releases() {
    let platform = MockPlatform::new();
    {
        let _chain =
            HandlerChain::install(&platform, &TEST_IMAGE, &SessionConfig::default()).unwrap();
    }
    assert_eq!(platform.vector_targets(), original_targets());
    assert_eq!(platform.frees.get(), 1);
}

#[test]
fn test_operations_out_of_order() {
    let platform = MockPlatform::new();
    let mut chain = HandlerChain::new(&platform, &TEST_IMAGE);
    assert!(matches!(chain.patch(), Err(AxError::BadState)));
    assert!(matches!(chain.allocate(&SessionConfig::default()), Err(AxError::BadState)));

    chain.locate().unwrap();
    chain.allocate(&SessionConfig::default()).unwrap();
    chain.patch().unwrap();
    assert!(matches!(chain.patch(), Err(AxError::AlreadyExists)));
    assert!(matches!(chain.locate(), Err(AxError::AlreadyExists)));
}

#[cfg(feature = "xscale")]
#[test]
fn test_xscale_patch_arms_and_restore_disarms() {
    let platform = MockPlatform::xscale();
    let mut chain = HandlerChain::install(&platform, &TEST_IMAGE, &debug_config()).unwrap();
    let cpu = &platform.cpu;
    assert_eq!(cpu.dbr0.get(), 0xa000_0100);
    assert_eq!(cpu.dbr1.get(), 0xff);
    assert_eq!(cpu.dbcon.get(), 2 | (1 << 8));
    assert_eq!(cpu.ibcr0.get(), 0x8000_1000 | 1);
    assert_eq!(cpu.pmnc.get(), 0xf);

    chain.restore();
    assert_eq!(cpu.dbcon.get(), 0);
    assert_eq!(cpu.ibcr0.get(), 0);
    assert_eq!(cpu.dcsr.get(), 0);
    assert_eq!(cpu.pmnc.get(), 0);
}

#[cfg(not(feature = "xscale"))]
#[test]
fn test_xscale_without_support_falls_back_to_generic() {
    let platform = MockPlatform::xscale();
    let chain = HandlerChain::install(&platform, &TEST_IMAGE, &debug_config()).unwrap();
    assert!(!chain.state().unwrap().family().is_xscale());
    assert_eq!(platform.cpu.pmnc.get(), 0);
    assert!(platform.cpu.dbcon_writes.borrow().is_empty());
}

#[test]
fn test_generic_patch_leaves_debug_unit_alone() {
    let platform = MockPlatform::new();
    let _chain = HandlerChain::install(&platform, &TEST_IMAGE, &debug_config()).unwrap();
    assert_eq!(platform.cpu.pmnc.get(), 0);
    assert!(platform.cpu.dbcon_writes.borrow().is_empty());
}

// =============================================================================
// Dispatch
// =============================================================================

#[test]
fn test_exceptions_reach_installed_state_only_while_patched() {
    let platform = MockPlatform::new();
    let regs = IrqRegs::default();
    assert_eq!(platform.dispatch(VectorSlot::Irq, &regs), None);

    let mut chain =
        HandlerChain::install(&platform, &TEST_IMAGE, &SessionConfig::default()).unwrap();
    assert_eq!(platform.dispatch(VectorSlot::Irq, &regs), Some(Disposition::Chain));
    assert_eq!(
        platform.dispatch(VectorSlot::DataAbort, &regs),
        Some(Disposition::Chain)
    );
    let counts = chain.state().unwrap().snapshot();
    assert_eq!((counts.irqs, counts.aborts), (1, 1));

    chain.restore();
    assert_eq!(platform.dispatch(VectorSlot::Irq, &regs), None);
    assert_eq!(chain.state().unwrap().snapshot().irqs, 1);
}

// =============================================================================
// Dispatch Image
// =============================================================================

static LINKED: [u8; 64] = [0; 64];

#[test]
fn test_image_from_linked_symbols() {
    let base = LINKED.as_ptr() as usize;
    let image = DispatchImage::from_symbols(&LINKED, base + 0x30, base, base + 0x10, base + 0x20)
        .unwrap();
    assert_eq!(image.vars_offset, 0x30);
    assert_eq!(
        (image.irq_entry, image.abort_entry, image.prefetch_entry),
        (0, 0x10, 0x20)
    );
    assert_eq!(image.code.len(), 64);
}

#[test]
fn test_image_symbols_outside_code_are_rejected() {
    let base = LINKED.as_ptr() as usize;
    // Entry before the section start.
    assert!(DispatchImage::from_symbols(&LINKED, base + 0x30, base - 4, base, base).is_none());
    // Entry past the end.
    assert!(DispatchImage::from_symbols(&LINKED, base + 0x30, base + 64, base, base).is_none());
    // Variables running off the end.
    assert!(DispatchImage::from_symbols(&LINKED, base + 0x34, base, base, base).is_none());
    // Misaligned entry.
    assert!(DispatchImage::from_symbols(&LINKED, base + 0x30, base + 2, base, base).is_none());
}

#[cfg(not(target_arch = "arm"))]
#[test]
fn test_no_builtin_image_off_target() {
    assert!(DispatchImage::builtin().is_none());
}

#[test]
fn test_block_size_covers_header_and_image() {
    assert_eq!(block_size(&TEST_IMAGE), CODE_OFFSET + TEST_IMAGE.code.len());
    assert!(STATE_OFFSET < CODE_OFFSET);
}
