#[cfg(not(feature = "loom"))]
pub use core::hint::spin_loop;
#[cfg(feature = "loom")]
pub use loom::hint::spin_loop;

#[cfg(not(feature = "loom"))]
pub use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[cfg(feature = "loom")]
pub use loom::thread;
#[cfg(all(not(feature = "loom"), any(test, feature = "std")))]
pub use std::thread;

/// Spin budget for polling loops over a shared slot.
///
/// Neither side of a mailbox has a wake-up primitive that works across both
/// address spaces, so waiting is polling. `Backoff` spins for a bounded number
/// of iterations and then tells the caller to back off further (sleep, or
/// yield under loom).
#[derive(Debug, Clone)]
pub struct Backoff {
    spins: u32,
    limit: u32,
}

impl Backoff {
    pub const fn new(limit: u32) -> Self {
        Self { spins: 0, limit }
    }

    /// Spin once. Returns `true` when the spin budget is used up and the
    /// caller should sleep before polling again.
    #[inline]
    pub fn snooze(&mut self) -> bool {
        if self.spins < self.limit {
            self.spins += 1;
            spin_loop();
            false
        } else {
            true
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.spins = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(64)
    }
}
