//! Buffer identifier type.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a purgeable buffer for the lifetime of the process.
///
/// The LRU cache indexes its entries by this id rather than by pointer, so
/// identity survives resizing and re-adoption of the backing storage.
///
/// # Example
/// ```
/// use purgemem::BufferId;
///
/// let a = BufferId::next();
/// let b = BufferId::next();
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl BufferId {
    /// Allocate a fresh, never-reused id.
    #[inline]
    pub fn next() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({})", self.0)
    }
}
