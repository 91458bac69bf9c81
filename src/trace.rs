//! Trace channel between exception context and the polling thread.
//!
//! `TraceRing` is a fixed-capacity single-producer/single-consumer ring of
//! `TraceRecord`s. The exception path is the only producer and the session
//! driver the only consumer. Cursors are free-running `u32`s: each side
//! advances only its own cursor, and `write_pos - read_pos` never exceeds the
//! capacity. A full ring drops the record and bumps the overflow counter.

use core::cell::UnsafeCell;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU32, Ordering};

/// Number of records in a session's trace buffer.
pub const TRACE_CAPACITY: usize = 8192;

/// Kind of event a record describes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceTag {
    /// `[id, clock, value, mask, addr]` memory poll match.
    MemPoll = 1,
    /// `[clock, irq]` interrupt source pending.
    Irq = 2,
    /// `[clock, pc, insn, rd, rn]` data watchpoint hit.
    MemAccess = 3,
    /// `[clock, pc, reg1, reg2]` instruction breakpoint hit.
    InsnTrace = 4,
    /// Clock counter was reset by the host and the debug unit re-armed.
    Resumed = 5,
}

impl TraceTag {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::MemPoll,
            2 => Self::Irq,
            3 => Self::MemAccess,
            4 => Self::InsnTrace,
            5 => Self::Resumed,
            _ => return None,
        })
    }
}

/// One trace buffer entry: a format tag plus five generic payload words.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceRecord {
    pub tag: u32,
    pub data: [u32; 5],
}

impl TraceRecord {
    pub const EMPTY: Self = Self {
        tag: 0,
        data: [0; 5],
    };

    pub fn new(tag: TraceTag, data: [u32; 5]) -> Self {
        Self {
            tag: tag as u32,
            data,
        }
    }

    pub fn tag(&self) -> Option<TraceTag> {
        TraceTag::from_raw(self.tag)
    }
}

/// Lock-free SPSC ring buffer of trace records.
///
/// An all-zero bit pattern is a valid empty ring, which lets the installer
/// build one inside freshly zeroed physical memory.
#[repr(C)]
pub struct TraceRing<const N: usize> {
    write_pos: AtomicU32,
    read_pos: AtomicU32,
    overflows: AtomicU32,
    slots: [UnsafeCell<TraceRecord>; N],
}

// SAFETY: a slot is written only by the producer while it lies outside
// `read_pos..write_pos`, and read only by the consumer while inside it. The
// release store of the owning cursor publishes the slot to the other side.
unsafe impl<const N: usize> Sync for TraceRing<N> {}

impl<const N: usize> TraceRing<N> {
    const VALID_CAPACITY: () = assert!(
        N.is_power_of_two() && N <= (1 << 31),
        "trace ring capacity must be a power of two"
    );

    /// Create an empty ring.
    pub const fn new() -> Self {
        let () = Self::VALID_CAPACITY;
        Self {
            write_pos: AtomicU32::new(0),
            read_pos: AtomicU32::new(0),
            overflows: AtomicU32::new(0),
            slots: [const { UnsafeCell::new(TraceRecord::EMPTY) }; N],
        }
    }

    /// Initialize an empty ring at `this` without building it on the stack.
    ///
    /// # Safety
    /// `this` must be valid for writes and suitably aligned.
    pub unsafe fn init_in_place(this: *mut Self) {
        let () = Self::VALID_CAPACITY;
        unsafe {
            addr_of_mut!((*this).write_pos).write(AtomicU32::new(0));
            addr_of_mut!((*this).read_pos).write(AtomicU32::new(0));
            addr_of_mut!((*this).overflows).write(AtomicU32::new(0));
            addr_of_mut!((*this).slots).write_bytes(0, 1);
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Producer side: append one record.
    ///
    /// Returns `false` and counts an overflow when the ring is full. Never
    /// blocks.
    #[inline(always)]
    pub fn append(&self, tag: TraceTag, data: [u32; 5]) -> bool {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        if write.wrapping_sub(read) as usize >= N {
            self.overflows.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let slot = &self.slots[write as usize & (N - 1)];
        unsafe { slot.get().write(TraceRecord::new(tag, data)) };
        self.write_pos.store(write.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side: take the oldest record, if any.
    pub fn drain(&self) -> Option<TraceRecord> {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let record = unsafe { self.slots[read as usize & (N - 1)].get().read() };
        self.read_pos.store(read.wrapping_add(1), Ordering::Release);
        Some(record)
    }

    /// Number of records currently retained.
    pub fn len(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total records dropped because the ring was full.
    pub fn overflows(&self) -> u32 {
        self.overflows.load(Ordering::Relaxed)
    }
}

impl<const N: usize> Default for TraceRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer-side bookkeeping for overflow warnings.
///
/// Compares the producer's counter to the last reported value. A report may
/// lag a drain by one cycle, but every overflow is reported exactly once.
#[derive(Debug, Default)]
pub struct OverflowTracker {
    last_reported: u32,
}

impl OverflowTracker {
    pub const fn new() -> Self {
        Self { last_reported: 0 }
    }

    /// Returns the number of overflows since the previous call, if any.
    pub fn check(&mut self, current: u32) -> Option<u32> {
        if current == self.last_reported {
            return None;
        }
        let delta = current.wrapping_sub(self.last_reported);
        self.last_reported = current;
        Some(delta)
    }

    pub fn reported(&self) -> u32 {
        self.last_reported
    }
}
