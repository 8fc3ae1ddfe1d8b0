//! Time source and wake signal

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Millisecond clock
pub trait Clock: Send {
    /// Milliseconds since an arbitrary origin
    fn now_ms(&self) -> u64;

    /// Block for `ms` milliseconds
    fn delay_ms(&self, ms: u64);
}

/// Wall clock
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Clock starting at zero now
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn delay_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Cross-thread wake request for a sleeping node
///
/// Cloning shares the same flag. A wake is consumed by the first
/// [`WakeToken::take`] that sees it.
#[derive(Debug, Clone, Default)]
pub struct WakeToken(Arc<AtomicBool>);

impl WakeToken {
    /// Unfired token
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the sleeper to wake
    pub fn wake(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Consume a pending wake
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}
