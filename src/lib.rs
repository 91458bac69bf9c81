//! Interrupt and Debug-Event Watch Monitor
//!
//! Chains handlers in front of a running host's interrupt, data abort and
//! prefetch abort vectors, records what happens in a lock-free trace ring,
//! and reports it from a polling thread until the session ends and the
//! original vectors are put back.
//!
//! # Features
//!
//! - `xscale` - Hardware watchpoint/breakpoint support for Intel XScale
//!   (PXA) cores (default)
//!
//! # Quick Start
//!
//! ```ignore
//! use axirqwatch::{DispatchImage, config, poll::PollListKind, session};
//!
//! axirqwatch::init();
//!
//! // Report every time the word at 0xa0001000 reads 5.
//! config::settings().add_watch(PollListKind::Trace, 0xa000_1000, None, 32, 5)?;
//!
//! // Watch for ten seconds using the crate's own handler section.
//! let image = DispatchImage::builtin().ok_or(AxError::Unsupported)?;
//! let summary = session::watch_irqs(&platform, &image, 10)?;
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod chip;
pub mod platform;
pub mod regs;

// =============================================================================
// Exception Path
// =============================================================================

pub mod debug;
#[cfg(target_arch = "arm")]
mod dispatch;
pub mod handler;
pub mod poll;
pub mod state;
pub mod trace;

// =============================================================================
// Installer and Session
// =============================================================================

pub mod chain;
pub mod config;
pub mod report;
pub mod session;

// Re-export key types for convenience
pub use chain::{DispatchImage, Error as ChainError, HandlerChain, InstallerState, VectorSlot};
pub use config::{SessionConfig, WatchSettings, settings};
pub use handler::Disposition;
pub use platform::Platform;
pub use session::{SessionSummary, run_session, watch_irqs};
pub use state::SessionState;
pub use trace::{TraceRecord, TraceRing, TraceTag};

/// Initialize the watch subsystem.
///
/// Only logs what was built in; settings start at their defaults.
pub fn init() {
    info!("Initializing axirqwatch...");
    info!("  - trace ring: {} records", trace::TRACE_CAPACITY);
    info!(
        "  - watch lists: {} entries each, {} ignored pcs",
        config::MAX_WATCHES,
        state::MAX_IGNORE_ADDRS
    );

    #[cfg(feature = "xscale")]
    info!("  - xscale hardware debug enabled");

    match chain::DispatchImage::builtin() {
        Some(image) => info!("  - handler section: {} bytes", image.code.len()),
        None => info!("  - no handler section on this target"),
    }

    info!("axirqwatch initialization complete");
}
