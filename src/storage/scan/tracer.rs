use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::types::{IndexError, Result};

/// Trait for tracing page cursor activity during a scan.
///
/// Stores call these hooks for every page they touch on behalf of a scan, so
/// callers can attribute I/O to the scan that caused it.
pub trait CursorTracer: Send + Sync {
    /// Records a page being pinned by a cursor.
    fn pin(&self);

    /// Records a page being released by a cursor.
    fn unpin(&self);

    /// Records a pin served from memory.
    fn hit(&self);

    /// Records a pin that had to load the page.
    fn fault(&self);
}

/// A no-op implementation of [`CursorTracer`] that discards every event.
#[derive(Default)]
pub struct NoopCursorTracer;

impl CursorTracer for NoopCursorTracer {
    fn pin(&self) {}
    fn unpin(&self) {}
    fn hit(&self) {}
    fn fault(&self) {}
}

/// A thread-safe counter-based implementation of [`CursorTracer`].
#[derive(Default)]
pub struct CountingCursorTracer {
    /// Pages pinned.
    pub pins: AtomicU64,

    /// Pages released.
    pub unpins: AtomicU64,

    /// Pins served from memory.
    pub hits: AtomicU64,

    /// Pins that loaded the page.
    pub faults: AtomicU64,
}

/// Point-in-time copy of [`CountingCursorTracer`] counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CursorStats {
    /// Pages pinned.
    pub pins: u64,
    /// Pages released.
    pub unpins: u64,
    /// Pins served from memory.
    pub hits: u64,
    /// Pins that loaded the page.
    pub faults: u64,
}

impl CountingCursorTracer {
    /// Copies the counters.
    pub fn stats(&self) -> CursorStats {
        CursorStats {
            pins: self.pins.load(Ordering::Relaxed),
            unpins: self.unpins.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

impl CursorTracer for CountingCursorTracer {
    fn pin(&self) {
        self.pins.fetch_add(1, Ordering::Relaxed);
    }

    fn unpin(&self) {
        self.unpins.fetch_add(1, Ordering::Relaxed);
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default tracer, which records nothing.
pub fn default_tracer() -> Arc<dyn CursorTracer> {
    Arc::new(NoopCursorTracer)
}

/// Accounting for transient heap held while a scan processes one entity.
pub trait MemoryTracker: Send + Sync {
    /// Reserves `bytes`; fails when the reservation would exceed the limit.
    fn allocate(&self, bytes: usize) -> Result<()>;

    /// Returns `bytes` previously reserved.
    fn release(&self, bytes: usize);

    /// Bytes currently reserved.
    fn used(&self) -> usize;

    /// Highest reservation seen.
    fn peak(&self) -> usize;
}

/// [`MemoryTracker`] with an optional ceiling, local to one scan.
#[derive(Debug, Default)]
pub struct LocalMemoryTracker {
    limit: Option<usize>,
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl LocalMemoryTracker {
    /// Tracker refusing reservations above `limit` bytes, if set.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Configured ceiling.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

impl MemoryTracker for LocalMemoryTracker {
    fn allocate(&self, bytes: usize) -> Result<()> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if let Some(limit) = self.limit {
                if next > limit {
                    return Err(IndexError::MemoryLimitExceeded {
                        requested: next,
                        limit,
                    });
                }
            }
            match self
                .used
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::AcqRel);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}
