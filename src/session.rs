//! Watch session driver.
//!
//! Installs the handler chain, drains the trace ring into report lines for
//! the requested duration, restores the original handlers and reports the
//! session totals.

use alloc::format;
use core::fmt;

use axerrno::AxResult;

use crate::chain::{DispatchImage, HandlerChain};
use crate::config::{self, SessionConfig};
use crate::debug::DebugConfig;
use crate::platform::Platform;
use crate::report::TraceReporter;
use crate::state::CounterSnapshot;
use crate::trace::TraceRing;

/// Records reported before the clock is re-checked.
pub const DRAIN_BURST: u32 = 100;

/// End-of-session totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub counters: CounterSnapshot,
    /// Report lines produced from trace records.
    pub reported: u32,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        write!(
            f,
            "Handled {} irq, {} abort, {} prefetch, {} lost, {} errors",
            c.irqs, c.aborts, c.prefetches, c.overflows, c.errors
        )
    }
}

fn announce(cfg: &DebugConfig) {
    if !cfg.is_active() {
        return;
    }
    info!(
        "Will set memory tracing to: dbr0={:08x} dbr1={:08x} dbcon={:08x}",
        cfg.dbr0, cfg.dbr1, cfg.dbcon
    );
    for (index, bp) in cfg.breakpoints.iter().enumerate() {
        if let Some(bp) = bp {
            info!(
                "Will set software debug {} to: {:08x}->{:08x} regs r{} r{}",
                index, bp.addr, bp.rearm, bp.reg1, bp.reg2
            );
        }
    }
}

fn drain_for<P: Platform, const N: usize>(
    platform: &P,
    ring: &TraceRing<N>,
    reporter: &mut TraceReporter<'_, P>,
    seconds: u32,
) {
    let start = platform.now_ms();
    let finish = start + u64::from(seconds) * 1000;
    let mut now = start;
    let mut burst = 0;
    while now <= finish {
        let msecs = (now - start) as u32;
        if reporter.report_next(ring, msecs) {
            burst += 1;
            if burst < DRAIN_BURST {
                continue;
            }
        } else {
            platform.idle();
        }
        now = platform.now_ms();
        burst = 0;
    }
}

/// Run one watch session for `seconds` with `config`.
///
/// Setup failures leave every vector untouched and return the error.
pub fn run_session<P: Platform>(
    platform: &P,
    image: &DispatchImage,
    config: &SessionConfig,
    seconds: u32,
) -> AxResult<SessionSummary> {
    let mut chain = HandlerChain::new(platform, image);
    chain.locate()?;
    chain.allocate(config)?;
    if let Some(state) = chain.state() {
        if state.family().is_xscale() {
            announce(state.debug());
        }
        debug!(
            "session: {} irq watches, {} trace watches, {} ignored pcs",
            config.irq_watches.len(),
            config.trace_watches.len(),
            state.ignore_addrs().len()
        );
    }
    chain.patch()?;

    let mut reporter = TraceReporter::new(platform);
    if let Some(state) = chain.state() {
        drain_for(platform, state.trace(), &mut reporter, seconds);
    }

    chain.restore();

    let mut summary = SessionSummary::default();
    if let Some(state) = chain.state() {
        while reporter.report_next(state.trace(), 0) {}
        summary.counters = state.snapshot();
    }
    summary.reported = reporter.reported();
    platform.report(&format!("{}", summary));
    debug!(
        "session: {} debug aborts, {} debug prefetches, {} lines reported",
        summary.counters.debug_aborts, summary.counters.debug_prefetches, summary.reported
    );
    if summary.counters.overflows != 0 || summary.counters.errors != 0 {
        warn!("session: {}", summary);
    }

    chain.release();
    Ok(summary)
}

/// Run a session with a snapshot of the process-wide watch settings.
pub fn watch_irqs<P: Platform>(
    platform: &P,
    image: &DispatchImage,
    seconds: u32,
) -> AxResult<SessionSummary> {
    let config = config::settings().snapshot();
    info!("session: watching for {} seconds", seconds);
    run_session(platform, image, &config, seconds)
}
