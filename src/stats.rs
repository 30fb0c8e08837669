use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, TimeZone, Utc};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Atomic pool counters. Snapshots are taken lock-free; the monotonic
/// counters never decrease.
#[derive(Debug, Default)]
pub(crate) struct PoolStats {
    pool_size: AtomicUsize,
    created: AtomicU64,
    invalidated: AtomicU64,
    borrowed: AtomicU64,
    returned: AtomicU64,
    last_access_ms: AtomicI64,
}

impl PoolStats {
    pub(crate) fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Acquire)
    }

    /// A new object entered the pool.
    pub(crate) fn record_created(&self) {
        self.pool_size.fetch_add(1, Ordering::AcqRel);
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    /// An object left the pool for good.
    pub(crate) fn record_invalidated(&self) {
        self.pool_size.fetch_sub(1, Ordering::AcqRel);
        self.invalidated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_borrowed(&self, now_ms: i64) {
        self.borrowed.fetch_add(1, Ordering::Relaxed);
        self.touch(now_ms);
    }

    pub(crate) fn record_returned(&self, now_ms: i64) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        self.touch(now_ms);
    }

    pub(crate) fn touch(&self, now_ms: i64) {
        self.last_access_ms.store(now_ms, Ordering::Release);
    }

    pub(crate) fn snapshot(&self) -> Status {
        Status {
            pool_size: self.pool_size(),
            created: self.created.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            borrowed: self.borrowed.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            last_access_ms: self.last_access_ms.load(Ordering::Acquire),
        }
    }
}

/// A point-in-time snapshot of the pool counters.
#[derive(Debug, Clone)]
pub struct Status {
    /// Current number of live objects (idle plus borrowed).
    pub pool_size: usize,
    /// Objects created since the pool was built.
    pub created: u64,
    /// Objects invalidated since the pool was built.
    pub invalidated: u64,
    /// Successful borrows.
    pub borrowed: u64,
    /// Successful returns to the idle deque.
    pub returned: u64,
    /// Last borrow/return activity, milliseconds since the Unix epoch.
    /// Zero if the pool was never used.
    pub last_access_ms: i64,
}

impl Status {
    /// The last borrow/return activity as a UTC timestamp, `None` if the
    /// pool was never used.
    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        if self.last_access_ms == 0 {
            return None;
        }
        Utc.timestamp_millis_opt(self.last_access_ms).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = PoolStats::default();
        stats.record_created();
        stats.record_created();
        stats.record_borrowed(10);
        stats.record_returned(20);
        stats.record_invalidated();

        let status = stats.snapshot();
        assert_eq!(status.pool_size, 1);
        assert_eq!(status.created, 2);
        assert_eq!(status.invalidated, 1);
        assert_eq!(status.borrowed, 1);
        assert_eq!(status.returned, 1);
        assert_eq!(status.last_access_ms, 20);
    }

    #[test]
    fn last_access_renders_as_utc() {
        let stats = PoolStats::default();
        assert!(stats.snapshot().last_access().is_none());

        stats.touch(1_600_000_000_000);
        let at = stats.snapshot().last_access().unwrap();
        assert_eq!(at.timestamp_millis(), 1_600_000_000_000);
    }
}
