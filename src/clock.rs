//! Time sources for the emulated bus.
//!
//! Every timed behavior of the link (frame timers, reset and resume signaling windows, frame
//! numbers) reads milliseconds from a [`Clock`]. Tests use [`ManualClock`] to step time
//! deterministically.

use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Mask for the 11-bit USB frame number.
pub const FRAME_NUMBER_MASK: u64 = 0x7ff;

/// A monotonic millisecond time source.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin. Must never go backwards.
    fn now_ms(&self) -> u64;

    /// Current USB frame number (one frame per millisecond, 11 bits).
    fn frame_number(&self) -> u16 {
        (self.now_ms() & FRAME_NUMBER_MASK) as u16
    }
}

/// Wall clock backed by [`Instant`].
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Arc<Self> {
        Arc::new(MonotonicClock {
            origin: Instant::now(),
        })
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(ManualClock::default())
    }

    /// Moves the clock forward by `ms` milliseconds.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time. Going backwards is ignored.
    pub fn set(&self, ms: u64) {
        self.now.fetch_max(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
