//! Per-channel consumer counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by a channel's consumer thread.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    pub serviced: AtomicU64,
    pub blocking: AtomicU64,
    pub fire_and_forget: AtomicU64,
    pub replies: AtomicU64,
    /// Messages that only the base executor claimed.
    pub unclaimed: AtomicU64,
    /// Messages recalled by their producer before service.
    pub cancelled: AtomicU64,
}

/// A point-in-time copy of [`ChannelMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub serviced: u64,
    pub blocking: u64,
    pub fire_and_forget: u64,
    pub replies: u64,
    pub unclaimed: u64,
    pub cancelled: u64,
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_service(&self, wait: bool) {
        self.serviced.fetch_add(1, Ordering::Relaxed);
        if wait {
            self.blocking.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fire_and_forget.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_reply(&self) {
        self.replies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unclaimed(&self) {
        self.unclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            serviced: self.serviced.load(Ordering::Relaxed),
            blocking: self.blocking.load(Ordering::Relaxed),
            fire_and_forget: self.fire_and_forget.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            unclaimed: self.unclaimed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}
