//! Memory poll engine.
//!
//! A poll descriptor watches a memory location for a value of interest
//! without hardware breakpoint support: the location is read at a fixed
//! width, masked, and compared against an expected value every time an
//! exception samples it.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::regs::MemoryBus;
use crate::trace::{TraceRing, TraceTag};

/// Capacity of each poll list inside the session state.
pub const MAX_POLLS: usize = 32;

/// Width of a polled memory access.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Byte = 8,
    Half = 16,
    Word = 32,
}

impl AccessWidth {
    /// Parse a width given in bits (8, 16 or 32).
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(Self::Byte),
            16 => Some(Self::Half),
            32 => Some(Self::Word),
            _ => None,
        }
    }

    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Mask covering every bit of an access of this width.
    pub const fn full_mask(self) -> u32 {
        match self {
            Self::Byte => 0xff,
            Self::Half => 0xffff,
            Self::Word => 0xffff_ffff,
        }
    }

    #[inline(always)]
    fn read<B: MemoryBus>(self, bus: &B, addr: u32) -> u32 {
        match self {
            Self::Byte => bus.read8(addr) as u32,
            Self::Half => bus.read16(addr) as u32,
            Self::Word => bus.read32(addr),
        }
    }
}

/// Which of the two session poll lists a descriptor belongs to.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollListKind {
    /// Sampled on every interrupt.
    Irq = 0,
    /// Sampled on every interrupt and every debug event.
    Trace = 1,
}

impl PollListKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Irq => "irqwatch",
            Self::Trace => "tracewatch",
        }
    }

    /// Encode a descriptor identity into one payload word.
    #[inline(always)]
    pub const fn descriptor_id(self, index: usize) -> u32 {
        ((self as u32) << 16) | (index as u32 & 0xffff)
    }

    /// Decode a payload word produced by [`PollListKind::descriptor_id`].
    pub fn from_descriptor_id(id: u32) -> Option<(Self, usize)> {
        let kind = match id >> 16 {
            0 => Self::Irq,
            1 => Self::Trace,
            _ => return None,
        };
        Some((kind, (id & 0xffff) as usize))
    }
}

/// Address/mask/width/compare watch.
#[derive(Debug)]
pub struct PollDescriptor {
    addr: u32,
    width: AccessWidth,
    mask: u32,
    cmp_value: u32,
    one_shot: bool,
    suppressed: AtomicBool,
}

impl PollDescriptor {
    const EMPTY: Self = Self {
        addr: 0,
        width: AccessWidth::Word,
        mask: 0,
        cmp_value: 0,
        one_shot: false,
        suppressed: AtomicBool::new(false),
    };

    /// Watch `addr` for `(value & mask) == cmp_value`.
    ///
    /// A missing mask compares every bit of the access; a mask wider than
    /// the access is clipped to it.
    pub fn new(addr: u32, width: AccessWidth, mask: Option<u32>, cmp_value: u32) -> Self {
        let mask = mask.unwrap_or(u32::MAX) & width.full_mask();
        Self {
            addr,
            width,
            mask,
            cmp_value,
            one_shot: false,
            suppressed: AtomicBool::new(false),
        }
    }

    /// Report a match once, then stay quiet until the suppression flag is
    /// cleared by the consumer.
    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn width(&self) -> AccessWidth {
        self.width
    }

    /// Effective mask applied to every sample.
    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn cmp_value(&self) -> u32 {
        self.cmp_value
    }

    pub fn is_one_shot(&self) -> bool {
        self.one_shot
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Consumer side: allow a one-shot descriptor to report again.
    pub fn clear_suppression(&self) {
        self.suppressed.store(false, Ordering::Relaxed);
    }

    /// Read and compare. Returns the raw value when it matches and the
    /// descriptor is not suppressed.
    #[inline(always)]
    pub fn sample<B: MemoryBus>(&self, bus: &B) -> Option<u32> {
        if self.one_shot && self.suppressed.load(Ordering::Relaxed) {
            return None;
        }
        let value = self.width.read(bus, self.addr);
        ((value & self.mask) == self.cmp_value).then_some(value)
    }
}

impl Clone for PollDescriptor {
    fn clone(&self) -> Self {
        Self {
            addr: self.addr,
            width: self.width,
            mask: self.mask,
            cmp_value: self.cmp_value,
            one_shot: self.one_shot,
            suppressed: AtomicBool::new(self.is_suppressed()),
        }
    }
}

impl PartialEq for PollDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
            && self.width == other.width
            && self.mask == other.mask
            && self.cmp_value == other.cmp_value
            && self.one_shot == other.one_shot
    }
}

/// Bounded list of poll descriptors stored inline in the session state.
#[derive(Debug)]
pub struct PollList {
    kind: PollListKind,
    len: usize,
    items: [PollDescriptor; MAX_POLLS],
}

impl PollList {
    pub const fn new(kind: PollListKind) -> Self {
        Self {
            kind,
            len: 0,
            items: [const { PollDescriptor::EMPTY }; MAX_POLLS],
        }
    }

    /// Copy up to [`MAX_POLLS`] descriptors into a fresh list.
    pub fn from_slice(kind: PollListKind, descs: &[PollDescriptor]) -> Self {
        let mut list = Self::new(kind);
        for (slot, desc) in list.items.iter_mut().zip(descs) {
            *slot = desc.clone();
            slot.suppressed = AtomicBool::new(false);
        }
        list.len = descs.len().min(MAX_POLLS);
        list
    }

    pub fn kind(&self) -> PollListKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Option<&PollDescriptor> {
        self.as_slice().get(index)
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[PollDescriptor] {
        self.items.get(..self.len).unwrap_or(&[])
    }
}

/// Evaluate every descriptor in `list` and append one `MemPoll` record per
/// match. Returns the number of matches.
///
/// A record that cannot be appended clears the descriptor's suppression so
/// the match is retried on the next sample.
#[inline(always)]
pub fn poll_all<B: MemoryBus, const N: usize>(
    ring: &TraceRing<N>,
    bus: &B,
    clock: u32,
    list: &PollList,
) -> u32 {
    let mut found = 0;
    for (index, desc) in list.as_slice().iter().enumerate() {
        let Some(value) = desc.sample(bus) else {
            continue;
        };
        found += 1;
        let id = list.kind.descriptor_id(index);
        if ring.append(TraceTag::MemPoll, [id, clock, value, desc.mask, desc.addr]) {
            if desc.one_shot {
                desc.suppressed.store(true, Ordering::Relaxed);
            }
        } else {
            desc.suppressed.store(false, Ordering::Relaxed);
        }
    }
    found
}
