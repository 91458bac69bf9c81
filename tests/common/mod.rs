//! Mock collaborators shared by the integration tests.
//!
//! `MockPlatform` backs the handler block with heap memory and emulates the
//! target's 32-bit address space with a sparse word map. Its idle hook lets
//! a test raise simulated exceptions while a session is draining: `dispatch`
//! follows the patched vector literal to the dispatch variables and from
//! there to the installed session state, the way the relocated code does.

#![allow(dead_code)]

use std::alloc::{Layout, alloc, dealloc};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use axirqwatch::chain::{AsmVars, DispatchImage, PAGE_SIZE, VECTOR_BASE, VectorSlot};
use axirqwatch::chip::{
    ChipFamily, ChipOps, FamilyKind, PXA_GPIO_CTRL_PHYS, PXA_IRQ_CTRL_PHYS, XScaleBlocks,
};
use axirqwatch::handler::{self, Disposition};
use axirqwatch::platform::{Clock, MemAttrs, PhysBlock, PhysMemory, Platform, ReportSink};
use axirqwatch::regs::{CpuRegs, MemoryBus, Mmio};
use axirqwatch::state::{IrqRegs, SessionState};

// =============================================================================
// Address map
// =============================================================================

/// Physical address of the high vector page.
pub const VECTOR_PHYS: u32 = 0xa000_0000;
/// Where the mock maps the vector page.
pub const VECTOR_MAP: u32 = 0x9000_0000;
/// Where the mock maps the interrupt controller.
pub const IRQ_CTRL_MAP: u32 = 0x9100_0000;
/// Where the mock maps the GPIO controller.
pub const GPIO_CTRL_MAP: u32 = 0x9200_0000;
/// First fake MVA handed out for handler blocks.
pub const BLOCK_MVA_BASE: u32 = 0xc000_0000;

/// `ldr pc, [pc, #0x3f0]`
pub const LDR_PC_TRAMPOLINE: u32 = 0xe59f_f3f0;
pub const LITERAL_OFFSET: u32 = 0x3f8;

/// Original host handler for `slot`.
pub fn host_handler(slot: VectorSlot) -> u32 {
    match slot {
        VectorSlot::Irq => 0x8004_0100,
        VectorSlot::DataAbort => 0x8004_0200,
        VectorSlot::Prefetch => 0x8004_0300,
    }
}

pub fn literal_addr(slot: VectorSlot) -> u32 {
    VECTOR_MAP + slot.offset() + LITERAL_OFFSET
}

// =============================================================================
// Dispatch image
// =============================================================================

pub static DISPATCH_CODE: [u8; 64] = {
    let mut code = [0; 64];
    let mut i = 0;
    while i < code.len() {
        code[i] = i as u8 ^ 0xa5;
        i += 1;
    }
    code
};

pub static TEST_IMAGE: DispatchImage = DispatchImage {
    code: &DISPATCH_CODE,
    vars_offset: 0x30,
    irq_entry: 0x00,
    abort_entry: 0x10,
    prefetch_entry: 0x20,
};

// =============================================================================
// CPU registers
// =============================================================================

#[derive(Default)]
pub struct MockCpu {
    pub ccnt: Cell<u32>,
    pub dbcon: Cell<u32>,
    pub dbr0: Cell<u32>,
    pub dbr1: Cell<u32>,
    pub ibcr0: Cell<u32>,
    pub ibcr1: Cell<u32>,
    pub dcsr: Cell<u32>,
    pub evtsel: Cell<u32>,
    pub inten: Cell<u32>,
    pub pmnc: Cell<u32>,
    pub fsr: Cell<u32>,
    pub pid: Cell<u32>,
    pub spsr: Cell<u32>,
    pub cpsr: Cell<u32>,
    /// r13/r14 of the interrupted mode.
    pub banked: Cell<[u32; 2]>,
    pub banked_fetches: Cell<u32>,
    /// Every value written to DBCON, in order.
    pub dbcon_writes: RefCell<Vec<u32>>,
}

impl MockCpu {
    pub fn new() -> Self {
        let cpu = Self::default();
        cpu.cpsr.set(0x13);
        cpu.spsr.set(0x10);
        cpu
    }

    /// Make the next abort look like a debug event.
    pub fn raise_debug_event(&self) {
        self.fsr.set(1 << 9);
    }
}

impl CpuRegs for MockCpu {
    fn ccnt(&self) -> u32 {
        self.ccnt.get()
    }
    fn dbcon(&self) -> u32 {
        self.dbcon.get()
    }
    fn set_dbcon(&self, val: u32) {
        self.dbcon.set(val);
        self.dbcon_writes.borrow_mut().push(val);
    }
    fn set_dbr0(&self, val: u32) {
        self.dbr0.set(val);
    }
    fn set_dbr1(&self, val: u32) {
        self.dbr1.set(val);
    }
    fn set_ibcr0(&self, val: u32) {
        self.ibcr0.set(val);
    }
    fn set_ibcr1(&self, val: u32) {
        self.ibcr1.set(val);
    }
    fn set_dcsr(&self, val: u32) {
        self.dcsr.set(val);
    }
    fn set_evtsel(&self, val: u32) {
        self.evtsel.set(val);
    }
    fn set_inten(&self, val: u32) {
        self.inten.set(val);
    }
    fn set_pmnc(&self, val: u32) {
        self.pmnc.set(val);
    }
    fn fsr(&self) -> u32 {
        self.fsr.get()
    }
    fn pid(&self) -> u32 {
        self.pid.get()
    }
    fn spsr(&self) -> u32 {
        self.spsr.get()
    }
    fn cpsr(&self) -> u32 {
        self.cpsr.get()
    }
    fn set_cpsr_c(&self, val: u32) {
        self.cpsr.set(val);
    }
    fn banked_sp_lr(&self, _mode: u32) -> [u32; 2] {
        self.banked_fetches.set(self.banked_fetches.get() + 1);
        self.banked.get()
    }
}

// =============================================================================
// Memory bus
// =============================================================================

/// Sparse little-endian word memory. Unwritten words read as zero.
#[derive(Default)]
pub struct MockBus {
    words: RefCell<HashMap<u32, u32>>,
}

impl MockBus {
    pub fn poke(&self, addr: u32, val: u32) {
        self.words.borrow_mut().insert(addr & !3, val);
    }

    pub fn peek(&self, addr: u32) -> u32 {
        self.words.borrow().get(&(addr & !3)).copied().unwrap_or(0)
    }
}

impl MemoryBus for MockBus {
    fn read8(&self, addr: u32) -> u8 {
        (self.peek(addr) >> ((addr & 3) * 8)) as u8
    }
    fn read16(&self, addr: u32) -> u16 {
        (self.peek(addr) >> ((addr & 2) * 8)) as u16
    }
    fn read32(&self, addr: u32) -> u32 {
        self.peek(addr)
    }
    fn write32(&self, addr: u32, val: u32) {
        self.poke(addr, val);
    }
}

// =============================================================================
// Platform
// =============================================================================

struct Allocation {
    block: PhysBlock,
    layout: Layout,
}

type IdleHook = Box<dyn FnMut(&MockPlatform)>;

pub struct MockPlatform {
    pub cpu: MockCpu,
    pub bus: MockBus,
    pub family: Cell<FamilyKind>,
    pub fail_alloc: Cell<bool>,
    pub allocs: Cell<u32>,
    pub frees: Cell<u32>,
    pub flushes: Cell<u32>,
    pub now: Cell<u64>,
    /// Milliseconds that pass per idle call.
    pub tick_ms: Cell<u64>,
    lines: RefCell<Vec<String>>,
    live: RefCell<Vec<Allocation>>,
    next_mva: Cell<u32>,
    on_idle: RefCell<Option<IdleHook>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        let platform = Self {
            cpu: MockCpu::new(),
            bus: MockBus::default(),
            family: Cell::new(FamilyKind::Generic),
            fail_alloc: Cell::new(false),
            allocs: Cell::new(0),
            frees: Cell::new(0),
            flushes: Cell::new(0),
            now: Cell::new(1_000),
            tick_ms: Cell::new(10),
            lines: RefCell::new(Vec::new()),
            live: RefCell::new(Vec::new()),
            next_mva: Cell::new(BLOCK_MVA_BASE),
            on_idle: RefCell::new(None),
        };
        for slot in VectorSlot::ALL {
            platform.bus.poke(VECTOR_MAP + slot.offset(), LDR_PC_TRAMPOLINE);
            platform.bus.poke(literal_addr(slot), host_handler(slot));
        }
        platform
    }

    pub fn xscale() -> Self {
        let platform = Self::new();
        platform.family.set(FamilyKind::XScale);
        platform
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    pub fn vector_targets(&self) -> [u32; 3] {
        VectorSlot::ALL.map(|slot| self.bus.peek(literal_addr(slot)))
    }

    pub fn live_blocks(&self) -> usize {
        self.live.borrow().len()
    }

    /// Run `hook` every time the session yields.
    pub fn on_idle(&self, hook: impl FnMut(&MockPlatform) + 'static) {
        *self.on_idle.borrow_mut() = Some(Box::new(hook));
    }

    fn host_ptr(&self, mva: u32) -> Option<*mut u8> {
        self.live
            .borrow()
            .iter()
            .find(|a| a.block.contains_mva(mva))
            .map(|a| unsafe { a.block.virt.add((mva - a.block.mva) as usize) })
    }

    /// Copy `len` bytes of a live handler block starting at `mva`.
    pub fn block_bytes(&self, mva: u32, len: usize) -> Option<Vec<u8>> {
        let last = mva.checked_add(len.checked_sub(1)? as u32)?;
        self.host_ptr(last)?;
        let start = self.host_ptr(mva)?;
        Some(unsafe { std::slice::from_raw_parts(start, len) }.to_vec())
    }

    /// Session state reached through the patched vector for `slot`, if the
    /// vector currently points into a live handler block.
    pub fn installed_state(&self, slot: VectorSlot) -> Option<&SessionState> {
        let target = self.bus.peek(literal_addr(slot));
        let entry = self.host_ptr(target)?;
        let code = unsafe { entry.sub(entry_offset(slot)) };
        let vars = unsafe {
            code.add(TEST_IMAGE.vars_offset)
                .cast::<AsmVars>()
                .read_unaligned()
        };
        let state = self.host_ptr(vars.state_mva)?;
        Some(unsafe { &*state.cast::<SessionState>() })
    }

    /// Deliver one exception through the vector table. `None` means the
    /// vector still points at the host handler.
    pub fn dispatch(&self, slot: VectorSlot, regs: &IrqRegs) -> Option<Disposition> {
        let state = self.installed_state(slot)?;
        Some(match slot {
            VectorSlot::Irq => handler::irq(state, regs, &self.cpu, &self.bus),
            VectorSlot::DataAbort => handler::data_abort(state, regs, &self.cpu, &self.bus),
            VectorSlot::Prefetch => handler::prefetch_abort(state, regs, &self.cpu, &self.bus),
        })
    }

    /// Controller blocks as mapped by this platform.
    pub fn xscale_family() -> ChipFamily {
        ChipFamily::XScale(XScaleBlocks {
            irq_ctrl: Mmio::new(IRQ_CTRL_MAP),
            gpio_ctrl: Mmio::new(GPIO_CTRL_MAP),
        })
    }
}

fn entry_offset(slot: VectorSlot) -> usize {
    match slot {
        VectorSlot::Irq => TEST_IMAGE.irq_entry,
        VectorSlot::DataAbort => TEST_IMAGE.abort_entry,
        VectorSlot::Prefetch => TEST_IMAGE.prefetch_entry,
    }
}

impl Drop for MockPlatform {
    fn drop(&mut self) {
        for a in self.live.borrow_mut().drain(..) {
            unsafe { dealloc(a.block.virt, a.layout) };
        }
    }
}

impl ChipOps for MockPlatform {
    fn detect_family(&self) -> FamilyKind {
        self.family.get()
    }

    fn flush_icache(&self) {
        self.flushes.set(self.flushes.get() + 1);
    }

    fn irq_name(&self, irq: u32) -> &str {
        match irq {
            10 => "GPIOx",
            14 => "AC97",
            22 => "FFUART",
            26 => "OST0",
            _ => "unknown",
        }
    }
}

impl PhysMemory for MockPlatform {
    fn alloc_phys(&self, size: usize, attrs: MemAttrs) -> Option<PhysBlock> {
        assert_eq!(attrs, MemAttrs::HANDLER_BLOCK);
        if self.fail_alloc.get() {
            return None;
        }
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        let virt = unsafe { alloc(layout) };
        if virt.is_null() {
            return None;
        }
        // Leave a poison pattern so the installer has to zero the block.
        unsafe { virt.write_bytes(0xa5, size) };
        let mva = self.next_mva.get();
        self.next_mva
            .set(mva + (size.next_multiple_of(PAGE_SIZE) + PAGE_SIZE) as u32);
        let block = PhysBlock {
            virt,
            mva,
            phys: mva - 0x2000_0000,
            size,
        };
        self.allocs.set(self.allocs.get() + 1);
        self.live.borrow_mut().push(Allocation { block, layout });
        Some(block)
    }

    fn free_phys(&self, block: PhysBlock) {
        let mut live = self.live.borrow_mut();
        let index = live
            .iter()
            .position(|a| a.block == block)
            .expect("freeing a block that is not allocated");
        let a = live.remove(index);
        unsafe { dealloc(a.block.virt, a.layout) };
        self.frees.set(self.frees.get() + 1);
    }

    fn map_phys(&self, paddr: u32) -> Option<usize> {
        match paddr {
            VECTOR_PHYS => Some(VECTOR_MAP as usize),
            PXA_IRQ_CTRL_PHYS => Some(IRQ_CTRL_MAP as usize),
            PXA_GPIO_CTRL_PHYS => Some(GPIO_CTRL_MAP as usize),
            _ => None,
        }
    }

    fn virt_to_phys(&self, vaddr: u32) -> Option<u32> {
        (vaddr == VECTOR_BASE).then_some(VECTOR_PHYS)
    }
}

impl ReportSink for MockPlatform {
    fn report(&self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }
}

impl Clock for MockPlatform {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn idle(&self) {
        self.now.set(self.now.get() + self.tick_ms.get());
        let hook = self.on_idle.borrow_mut().take();
        if let Some(mut hook) = hook {
            hook(self);
            let mut slot = self.on_idle.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }
}

impl Platform for MockPlatform {
    type Cpu = MockCpu;
    type Bus = MockBus;

    fn cpu(&self) -> &MockCpu {
        &self.cpu
    }

    fn bus(&self) -> &MockBus {
        &self.bus
    }
}
