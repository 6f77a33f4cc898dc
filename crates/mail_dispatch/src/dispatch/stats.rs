use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time counters of a dispatcher, see [`super::Dispatcher::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Sends that waited one throttle tick first.
    pub throttled: u64,
    /// Times the loop found the queue empty and slept.
    pub idle_sleeps: u64,
    /// Observer calls that returned an error or panicked.
    pub observer_errors: u64,
}

impl DispatchStats {
    /// Messages that have completed a delivery attempt.
    pub fn attempted(&self) -> u64 {
        self.delivered + self.failed
    }
}

#[derive(Debug, Default)]
pub(crate) struct DispatchCounters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    throttled: AtomicU64,
    idle_sleeps: AtomicU64,
    observer_errors: AtomicU64,
}

impl DispatchCounters {
    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt(&self, delivered: bool, observer_errors: usize) {
        let counter = if delivered { &self.delivered } else { &self.failed };
        counter.fetch_add(1, Ordering::Relaxed);
        self.observer_errors
            .fetch_add(observer_errors as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_idle_sleep(&self) {
        self.idle_sleeps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            idle_sleeps: self.idle_sleeps.load(Ordering::Relaxed),
            observer_errors: self.observer_errors.load(Ordering::Relaxed),
        }
    }
}
