use std::sync::atomic::{AtomicU64, Ordering};

/// A snapshot of the activity of a [`Pool`][crate::Pool].
///
/// The counters are cumulative over the lifetime of the pool. `outstanding` and `available`
/// describe the moment the snapshot was taken.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Items created by the factory.
    pub allocated: u64,

    /// Items destroyed by the pool, whether because they were dirty, came back to an inactive
    /// pool or were drained on deactivation.
    pub destroyed: u64,

    /// Releases that returned the item to the available queue.
    pub recycled: u64,

    /// Items taken out of pool management via [`Pooled::detach()`][crate::Pooled::detach].
    pub detached: u64,

    /// Successful acquisitions.
    pub acquired: u64,

    /// Acquisitions that had to wait for an item to be released.
    pub waited: u64,

    /// Items currently handed out.
    pub outstanding: u32,

    /// Items currently waiting in the pool for an acquirer.
    pub available: usize,
}

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    allocated: AtomicU64,
    destroyed: AtomicU64,
    recycled: AtomicU64,
    detached: AtomicU64,
    acquired: AtomicU64,
    waited: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn record_allocated(&self, count: u64) {
        self.allocated.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_destroyed(&self, count: u64) {
        self.destroyed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_recycled(&self) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_detached(&self) {
        self.detached.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_waited(&self) {
        self.waited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, outstanding: u32, available: usize) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            detached: self.detached.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            waited: self.waited.load(Ordering::Relaxed),
            outstanding,
            available,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let counters = PoolCounters::default();

        counters.record_allocated(3);
        counters.record_destroyed(1);
        counters.record_recycled();
        counters.record_recycled();
        counters.record_detached();
        counters.record_acquired();
        counters.record_waited();

        let stats = counters.snapshot(2, 1);

        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.destroyed, 1);
        assert_eq!(stats.recycled, 2);
        assert_eq!(stats.detached, 1);
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.waited, 1);
        assert_eq!(stats.outstanding, 2);
        assert_eq!(stats.available, 1);
    }
}
