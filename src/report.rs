//! Trace report formatting.
//!
//! Turns drained trace records into report lines.
//!
//! Line format: `MSECS: CLOCK: EVENT`, where MSECS is milliseconds since the
//! session started (six digits) and CLOCK the raw cycle counter (eight hex
//! digits).

use alloc::format;
use alloc::string::String;

use crate::chip::ChipOps;
use crate::debug::insn_name;
use crate::platform::ReportSink;
use crate::poll::PollListKind;
use crate::state::START_GPIO_IRQS;
use crate::trace::{OverflowTracker, TraceRecord, TraceRing, TraceTag};

/// Format one record.
pub fn format_record<C: ChipOps + ?Sized>(chip: &C, msecs: u32, record: &TraceRecord) -> String {
    let d = &record.data;
    let Some(tag) = record.tag() else {
        return format!("{:06}: unknown trace tag {}", msecs, record.tag);
    };
    match tag {
        TraceTag::Irq => {
            let (clock, irq) = (d[0], d[1]);
            if irq >= START_GPIO_IRQS {
                format!(
                    "{:06}: {:08x}: irq {}(gpio {})",
                    msecs,
                    clock,
                    irq,
                    irq - START_GPIO_IRQS
                )
            } else {
                format!("{:06}: {:08x}: irq {}({})", msecs, clock, irq, chip.irq_name(irq))
            }
        }
        TraceTag::MemAccess => {
            let (clock, pc, insn, rd, rn) = (d[0], d[1], d[2], d[3], d[4]);
            format!(
                "{:06}: {:08x}: debug {:08x}: {:08x}({}) {:08x} {:08x}",
                msecs,
                clock,
                pc,
                insn,
                insn_name(insn),
                rd,
                rn
            )
        }
        TraceTag::InsnTrace => {
            let (clock, pc, reg1, reg2) = (d[0], d[1], d[2], d[3]);
            format!("{:06}: {:08x}: insn {:08x}: {:08x} {:08x}", msecs, clock, pc, reg1, reg2)
        }
        TraceTag::MemPoll => {
            let (id, clock, value, mask, addr) = (d[0], d[1], d[2], d[3], d[4]);
            let (name, index) = match PollListKind::from_descriptor_id(id) {
                Some((kind, index)) => (kind.name(), index),
                None => ("watch", (id & 0xffff) as usize),
            };
            format!(
                "{:06}: {:08x}: {}{} {:08x}={:08x} ({:08x})",
                msecs, clock, name, index, addr, value, mask
            )
        }
        TraceTag::Resumed => format!("{:06}: {:08x}: cpu resumed", msecs, 0),
    }
}

/// Warning emitted when records were dropped.
pub fn format_overflow(lost: u32) -> String {
    format!("overflowed {} traces", lost)
}

/// Consumer side of one session's trace ring.
pub struct TraceReporter<'a, S: ReportSink + ChipOps> {
    sink: &'a S,
    overflow: OverflowTracker,
    reported: u32,
}

impl<'a, S: ReportSink + ChipOps> TraceReporter<'a, S> {
    pub fn new(sink: &'a S) -> Self {
        Self {
            sink,
            overflow: OverflowTracker::new(),
            reported: 0,
        }
    }

    /// Drain and report one record. Returns `false` if the ring was empty.
    pub fn report_next<const N: usize>(&mut self, ring: &TraceRing<N>, msecs: u32) -> bool {
        let Some(record) = ring.drain() else {
            return false;
        };
        if let Some(lost) = self.overflow.check(ring.overflows()) {
            self.sink.report(&format_overflow(lost));
        }
        self.sink.report(&format_record(self.sink, msecs, &record));
        self.reported += 1;
        true
    }

    /// Records reported so far.
    pub fn reported(&self) -> u32 {
        self.reported
    }
}
