//! Resource manager statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by the resource manager.
///
/// All fields are atomic and updated with `Ordering::Relaxed`: the counters
/// are independent and only need to be eventually consistent.
///
/// # Example
/// ```
/// use purgemem::ResourceStats;
/// use std::sync::atomic::Ordering;
///
/// let stats = ResourceStats::new();
/// stats.inserts.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(stats.snapshot().inserts, 1);
/// ```
#[derive(Debug, Default)]
pub struct ResourceStats {
    /// Buffers inserted into the LRU cache.
    pub inserts: AtomicU64,

    /// Buffers pushed out by capacity pressure or `remove_last_resource`.
    pub evictions: AtomicU64,

    /// Buffers removed through `remove_resource`.
    pub removals: AtomicU64,

    /// Per-buffer tasks dispatched by bulk access passes.
    pub bulk_tasks: AtomicU64,

    /// Bulk access tasks that failed to open a window.
    pub bulk_failures: AtomicU64,
}

impl ResourceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-atomic copy for display/logging.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            bulk_tasks: self.bulk_tasks.load(Ordering::Relaxed),
            bulk_failures: self.bulk_failures.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.inserts.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.removals.store(0, Ordering::Relaxed);
        self.bulk_tasks.store(0, Ordering::Relaxed);
        self.bulk_failures.store(0, Ordering::Relaxed);
    }
}

/// A point-in-time copy of [`ResourceStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub inserts: u64,
    pub evictions: u64,
    pub removals: u64,
    pub bulk_tasks: u64,
    pub bulk_failures: u64,
}

impl StatsSnapshot {
    /// Fraction of bulk tasks that opened their window (1.0 when none ran).
    pub fn bulk_success_rate(&self) -> f64 {
        if self.bulk_tasks == 0 {
            1.0
        } else {
            (self.bulk_tasks - self.bulk_failures) as f64 / self.bulk_tasks as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stats {{ inserts: {}, evictions: {}, removals: {}, bulk: {} ({:.2}% ok) }}",
            self.inserts,
            self.evictions,
            self.removals,
            self.bulk_tasks,
            self.bulk_success_rate() * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = ResourceStats::new();
        stats.inserts.fetch_add(3, Ordering::Relaxed);
        stats.bulk_tasks.fetch_add(4, Ordering::Relaxed);
        stats.bulk_failures.fetch_add(1, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.inserts, 3);
        assert_eq!(snapshot.bulk_success_rate(), 0.75);
    }

    #[test]
    fn test_stats_reset() {
        let stats = ResourceStats::new();
        stats.evictions.fetch_add(10, Ordering::Relaxed);
        stats.reset();
        assert_eq!(stats.snapshot().evictions, 0);
        assert_eq!(stats.snapshot().bulk_success_rate(), 1.0);
    }

    #[test]
    fn test_stats_display() {
        let stats = ResourceStats::new();
        stats.inserts.fetch_add(5, Ordering::Relaxed);
        stats.evictions.fetch_add(2, Ordering::Relaxed);

        let display = format!("{}", stats.snapshot());
        assert!(display.contains("inserts: 5"));
        assert!(display.contains("evictions: 2"));
        assert!(display.contains("100.00% ok"));
    }
}
