//! The capability interface the resource manager sees of a buffer.

use std::sync::Arc;

use crate::common::BufferId;

/// Narrow view of a purgeable buffer used by the LRU cache and the
/// resource manager.
///
/// The manager never touches buffer content directly; it pins evicted
/// buffers, marks buffers invalid before teardown and opens validity-gated
/// read windows during bulk access.
pub trait PurgeableResource: Send + Sync {
    fn id(&self) -> BufferId;

    /// Take one pin on the backing storage.
    fn pin(&self) -> bool;

    /// Drop one pin taken with [`pin`](Self::pin).
    fn unpin(&self) -> bool;

    /// Outstanding pins on the buffer.
    fn pin_status(&self) -> u32;

    fn set_data_valid(&self, valid: bool);

    fn is_data_valid(&self) -> bool;

    /// Open a read window if, and only if, the buffer is still valid.
    fn begin_read_with_data_lock(&self) -> bool;

    /// Close a window opened by
    /// [`begin_read_with_data_lock`](Self::begin_read_with_data_lock).
    fn end_read_with_data_lock(&self);
}

/// Shared handle to a tracked buffer.
pub type ResourceHandle = Arc<dyn PurgeableResource>;
