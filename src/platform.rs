//! Platform abstraction layer.
//!
//! The monitor is hosted by an operating system it does not own. Everything
//! it needs from that host (physical memory, time, an output sink, chip
//! services and register access) comes through the traits below, which also
//! lets the whole subsystem run against mocks in user space.

use crate::chip::ChipOps;
use crate::regs::{CpuRegs, MemoryBus};

/// Attributes requested for a physical allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAttrs {
    pub executable: bool,
    pub contiguous: bool,
    pub cached: bool,
}

impl MemAttrs {
    /// Physically contiguous, executable, cache-coherent memory for the
    /// handler chain.
    pub const HANDLER_BLOCK: Self = Self {
        executable: true,
        contiguous: true,
        cached: true,
    };
}

/// A block of physically contiguous memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysBlock {
    /// Address usable from the polling thread.
    pub virt: *mut u8,
    /// Address of the same memory as seen from exception context.
    pub mva: u32,
    /// Physical address.
    pub phys: u32,
    pub size: usize,
}

impl PhysBlock {
    /// Whether `mva` lies inside this block.
    pub fn contains_mva(&self, mva: u32) -> bool {
        mva.wrapping_sub(self.mva) < self.size as u32
    }
}

/// Physical memory service.
pub trait PhysMemory {
    /// Allocate `size` bytes with `attrs`. `None` on failure.
    fn alloc_phys(&self, size: usize, attrs: MemAttrs) -> Option<PhysBlock>;

    /// Release a block returned by [`PhysMemory::alloc_phys`].
    fn free_phys(&self, block: PhysBlock);

    /// Map the page at physical address `paddr` for read/write access and
    /// return its virtual address.
    fn map_phys(&self, paddr: u32) -> Option<usize>;

    /// Translate a virtual address of the running process to physical.
    fn virt_to_phys(&self, vaddr: u32) -> Option<u32>;
}

/// Generic output sink for report lines.
pub trait ReportSink {
    fn report(&self, line: &str);
}

/// Time source and scheduler hook of the polling thread.
pub trait Clock {
    /// Monotonic milliseconds.
    fn now_ms(&self) -> u64;

    /// Give the processor away until roughly the next scheduler tick.
    fn idle(&self);
}

/// Everything a watch session needs from its host.
pub trait Platform: ChipOps + PhysMemory + ReportSink + Clock {
    type Cpu: CpuRegs;
    type Bus: MemoryBus;

    fn cpu(&self) -> &Self::Cpu;
    fn bus(&self) -> &Self::Bus;
}
