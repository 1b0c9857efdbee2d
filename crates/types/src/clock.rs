//! Network-corrected clock
//!
//! Consensus timing reads "corrected" time: local wall time shifted by the
//! measured offset to the network's global time.

use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync {
    /// Milliseconds since the epoch, corrected to network time
    fn now_corrected_ms(&self) -> i64;
}

/// Wall clock plus a network offset
#[derive(Debug, Default)]
pub struct SystemClock {
    offset_ms: AtomicI64,
}

impl SystemClock {
    pub fn new(offset_ms: i64) -> Self {
        Self {
            offset_ms: AtomicI64::new(offset_ms),
        }
    }

    /// Record a freshly measured offset to network time
    pub fn set_offset_ms(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::SeqCst);
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst)
    }
}

impl Clock for SystemClock {
    fn now_corrected_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() + self.offset_ms()
    }
}

/// Deterministic clock for tests.
///
/// Time only advances when you tell it to.
#[derive(Debug, Default)]
pub struct ManualClock {
    current: AtomicI64,
}

impl ManualClock {
    pub fn new(initial_ms: i64) -> Self {
        Self {
            current: AtomicI64::new(initial_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.current.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.current.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_corrected_ms(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }
}
