//! The purgeable buffer state machine.
//!
//! A buffer is *unbuilt* until its builder chain first runs, *built-present*
//! while its backing holds the content, and *built-purged* once the kernel
//! (or the emulated reclaim scan) dropped pages. Every access goes through a
//! window:
//!
//! ```text
//! begin_read  ─ pin ─ shared lock ─┬─ content ok ─────────────────────► window open
//!                                  └─ needs rebuild ─ exclusive lock ─ rebuild (≤3) ─ downgrade ─► window open
//! end_read    ─ unpin ─ release shared lock
//!
//! begin_write ─ exclusive lock ─ pin ─ rebuild if needed ─► window open
//! end_write   ─ unpin ─ release exclusive lock
//! ```
//!
//! The content lock stays held between `begin_*` and `end_*`, so the
//! window survives across calls. Closing a window releases that lock on
//! behalf of whoever opened it, which is why `end_read`, `end_write` and
//! `modify_content_by_builder` are `unsafe`; [`read`](PurgeableBuffer::read)
//! and [`write`](PurgeableBuffer::write) are the safe surface. Pins are always taken and dropped while
//! the content lock is held, which keeps them on the same backing even if a
//! resize is queued behind the window.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, error, warn};

use crate::common::config::{is_valid_size, MAX_PURGEABLE_SIZE, MAX_REBUILD_ATTEMPTS};
use crate::common::{BufferId, Error, Result};
use crate::manager::PurgeableResource;
use crate::storage::{Backing, BackingKind, PageTableMode, SharedRegion};

use super::builder::{BuilderChain, PurgeableBuilder};
use super::guard::{ReadGuard, WriteGuard};

/// State guarded by the content lock.
struct Content {
    kind: BackingKind,
    mode: PageTableMode,
    backing: Option<Backing>,
    builders: BuilderChain,
}

/// State guarded by the validity lock.
#[derive(Debug)]
struct DataState {
    valid: bool,
    /// Read windows opened through `begin_read_with_data_lock`.
    held_reads: u32,
}

/// A region of regenerable memory.
///
/// # Example
/// ```no_run
/// use purgemem::PurgeableBuffer;
///
/// let buffer = PurgeableBuffer::new(
///     26,
///     Box::new(|data: &mut [u8]| {
///         data.copy_from_slice(b"ABCDEFGHIJKLMNOPQRSTUVWXYZ");
///         true
///     }),
/// );
/// if let Some(content) = buffer.read() {
///     assert_eq!(&content[..3], b"ABC");
/// };
/// ```
pub struct PurgeableBuffer {
    id: BufferId,
    content: RwLock<Content>,
    data: Mutex<DataState>,
    pins: AtomicU32,
    open_reads: AtomicU32,
    write_open: AtomicBool,
    rebuild_count: AtomicU64,
    // Mirrors of the backing's pointer and size, readable inside a window.
    content_ptr: AtomicPtr<u8>,
    content_size: AtomicUsize,
}

// ============================================================================
// Construction
// ============================================================================

impl PurgeableBuffer {
    /// Anonymous buffer of `size` bytes, page table mode detected from the
    /// running kernel.
    pub fn try_new(size: usize, builder: Box<dyn PurgeableBuilder>) -> Result<Self> {
        Self::try_with_page_table_mode(size, builder, PageTableMode::detect())
    }

    /// Anonymous buffer with an explicit page table mode.
    pub fn try_with_page_table_mode(
        size: usize,
        builder: Box<dyn PurgeableBuilder>,
        mode: PageTableMode,
    ) -> Result<Self> {
        let buffer = Self::empty(BackingKind::Anonymous, mode, builder);
        buffer.allocate(size)?;
        Ok(buffer)
    }

    /// Like [`try_new`](Self::try_new), but a failed allocation is logged
    /// and yields a content-less buffer on which every access fails.
    pub fn new(size: usize, builder: Box<dyn PurgeableBuilder>) -> Self {
        Self::with_page_table_mode(size, builder, PageTableMode::detect())
    }

    pub fn with_page_table_mode(
        size: usize,
        builder: Box<dyn PurgeableBuilder>,
        mode: PageTableMode,
    ) -> Self {
        let buffer = Self::empty(BackingKind::Anonymous, mode, builder);
        if let Err(e) = buffer.allocate(size) {
            error!(id = %buffer.id, size, error = %e, "creating anonymous buffer failed");
        }
        buffer
    }

    /// Buffer backed by a shared memory descriptor.
    pub fn try_new_shared(size: usize, builder: Box<dyn PurgeableBuilder>) -> Result<Self> {
        let buffer = Self::empty(BackingKind::SharedFd, PageTableMode::Disabled, builder);
        buffer.allocate(size)?;
        Ok(buffer)
    }

    pub fn new_shared(size: usize, builder: Box<dyn PurgeableBuilder>) -> Self {
        let buffer = Self::empty(BackingKind::SharedFd, PageTableMode::Disabled, builder);
        if let Err(e) = buffer.allocate(size) {
            error!(id = %buffer.id, size, error = %e, "creating shared buffer failed");
        }
        buffer
    }

    /// Shared-descriptor buffer whose storage is supplied later through
    /// [`resize_data`](Self::resize_data) or
    /// [`adopt_shared_memory`](Self::adopt_shared_memory).
    pub fn shared_deferred(builder: Box<dyn PurgeableBuilder>) -> Self {
        Self::empty(BackingKind::SharedFd, PageTableMode::Disabled, builder)
    }

    fn empty(kind: BackingKind, mode: PageTableMode, builder: Box<dyn PurgeableBuilder>) -> Self {
        let id = BufferId::next();
        debug!(%id, ?kind, ?mode, "buffer created");
        Self {
            id,
            content: RwLock::new(Content {
                kind,
                mode,
                backing: None,
                builders: BuilderChain::with(builder),
            }),
            data: Mutex::new(DataState {
                valid: true,
                held_reads: 0,
            }),
            pins: AtomicU32::new(0),
            open_reads: AtomicU32::new(0),
            write_open: AtomicBool::new(false),
            rebuild_count: AtomicU64::new(0),
            content_ptr: AtomicPtr::new(std::ptr::null_mut()),
            content_size: AtomicUsize::new(0),
        }
    }

    fn allocate(&self, size: usize) -> Result<()> {
        if !is_valid_size(size) {
            return Err(Error::InvalidSize {
                size,
                max: MAX_PURGEABLE_SIZE,
            });
        }
        let mut content = self.content.write();
        let backing = Backing::allocate(content.kind, size, content.mode)?;
        self.publish(Some(&backing));
        content.backing = Some(backing);
        Ok(())
    }

    fn publish(&self, backing: Option<&Backing>) {
        let (ptr, size) = backing.map_or((std::ptr::null_mut(), 0), |b| (b.as_mut_ptr(), b.len()));
        self.content_ptr.store(ptr, Ordering::Release);
        self.content_size.store(size, Ordering::Release);
    }
}

// ============================================================================
// Access windows
// ============================================================================

impl PurgeableBuffer {
    /// Open a read window, rebuilding purged content first.
    ///
    /// Returns `false` if the buffer is invalid, has no storage, or could
    /// not be rebuilt. A window that is never closed keeps the buffer
    /// pinned and locked.
    pub fn begin_read(&self) -> bool {
        debug!(id = %self.id, "begin read");
        if !self.is_data_valid() {
            debug!(id = %self.id, "begin read on invalid buffer");
            return false;
        }
        self.begin_read_inner()
    }

    fn begin_read_inner(&self) -> bool {
        let content = self.content.read_recursive();
        if !self.pin_locked(&content) {
            debug!(id = %self.id, "begin read on buffer without content");
            return false;
        }
        if !self.needs_rebuild(&content) {
            std::mem::forget(content);
            self.open_reads.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        self.unpin_locked(&content);
        drop(content);

        let mut content = self.content.write();
        if !self.pin_locked(&content) {
            return false;
        }
        if self.needs_rebuild(&content) && !self.rebuild_locked(&mut content) {
            self.unpin_locked(&content);
            return false;
        }
        std::mem::forget(RwLockWriteGuard::downgrade(content));
        self.open_reads.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Close a read window.
    ///
    /// With no read window open this logs and does nothing.
    ///
    /// # Safety
    /// The caller must own a read window opened by a successful
    /// [`begin_read`](Self::begin_read), and must not use any reference
    /// into the content derived from that window afterwards. Closing a
    /// window some other thread is still using lets a writer in under it.
    ///
    /// ```compile_fail
    /// # use purgemem::PurgeableBuffer;
    /// let buffer = PurgeableBuffer::new(8, Box::new(|_: &mut [u8]| true));
    /// buffer.end_read();
    /// ```
    pub unsafe fn end_read(&self) {
        debug!(id = %self.id, "end read");
        if self
            .open_reads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            warn!(id = %self.id, "end read without an open read window");
            return;
        }
        // SAFETY: the open read window holds the content lock shared.
        unsafe {
            self.unpin_locked(&*self.content.data_ptr());
            self.content.force_unlock_read();
        }
    }

    /// Open a write window, rebuilding purged content first.
    ///
    /// Blocks while any other window is open.
    pub fn begin_write(&self) -> bool {
        debug!(id = %self.id, "begin write");
        if !self.is_data_valid() {
            debug!(id = %self.id, "begin write on invalid buffer");
            return false;
        }
        let mut content = self.content.write();
        if !self.pin_locked(&content) {
            debug!(id = %self.id, "begin write on buffer without content");
            return false;
        }
        if self.needs_rebuild(&content) && !self.rebuild_locked(&mut content) {
            self.unpin_locked(&content);
            return false;
        }
        std::mem::forget(content);
        self.write_open.store(true, Ordering::Release);
        true
    }

    /// Close a write window.
    ///
    /// With no write window open this logs and does nothing.
    ///
    /// # Safety
    /// The caller must own the write window opened by a successful
    /// [`begin_write`](Self::begin_write), and must not use any reference
    /// into the content derived from that window afterwards.
    ///
    /// ```compile_fail
    /// # use purgemem::PurgeableBuffer;
    /// let buffer = PurgeableBuffer::new(8, Box::new(|_: &mut [u8]| true));
    /// let mut guard = buffer.write().unwrap();
    /// buffer.end_write();
    /// guard[0] = 1;
    /// ```
    pub unsafe fn end_write(&self) {
        debug!(id = %self.id, "end write");
        if !self.write_open.swap(false, Ordering::AcqRel) {
            warn!(id = %self.id, "end write without an open write window");
            return;
        }
        // SAFETY: the open write window holds the content lock exclusively.
        unsafe {
            self.unpin_locked(&*self.content.data_ptr());
            self.content.force_unlock_write();
        }
    }

    /// Scoped read window; `None` when [`begin_read`](Self::begin_read)
    /// fails.
    pub fn read(&self) -> Option<ReadGuard<'_>> {
        if !self.begin_read() {
            return None;
        }
        Some(ReadGuard::new(self, self.content_ptr(), self.content_size()))
    }

    /// Scoped write window; `None` when [`begin_write`](Self::begin_write)
    /// fails.
    pub fn write(&self) -> Option<WriteGuard<'_>> {
        if !self.begin_write() {
            return None;
        }
        Some(WriteGuard::new(self, self.content_ptr(), self.content_size()))
    }

    /// Apply `builder` to the live content and append it to the chain so
    /// every later rebuild replays it.
    ///
    /// Returns `false` without touching anything when no write window is
    /// open or the builder fails. [`WriteGuard::modify`] is the safe form.
    ///
    /// # Safety
    /// The caller must own the open write window and hold no reference
    /// into the content while the builder runs.
    pub unsafe fn modify_content_by_builder(&self, mut builder: Box<dyn PurgeableBuilder>) -> bool {
        if !self.write_open.load(Ordering::Acquire) {
            warn!(id = %self.id, "modify outside a write window");
            return false;
        }
        // SAFETY: the caller owns the write window, which holds the content
        // lock exclusively.
        let content = unsafe { &mut *self.content.data_ptr() };
        let Some(backing) = content.backing.as_ref() else {
            return false;
        };
        // SAFETY: the mapping spans at least the declared size.
        let data = unsafe { std::slice::from_raw_parts_mut(backing.as_mut_ptr(), backing.len()) };
        if !builder.build(data) {
            error!(id = %self.id, "modify content by builder failed");
            return false;
        }
        content.builders.append(builder);
        debug!(id = %self.id, chain_len = content.builders.len(), "builder appended");
        true
    }

    fn needs_rebuild(&self, content: &Content) -> bool {
        if self.rebuild_count.load(Ordering::Acquire) == 0 {
            return true;
        }
        content.backing.as_ref().is_some_and(Backing::is_purged)
    }

    /// Replay the chain up to [`MAX_REBUILD_ATTEMPTS`] times.
    fn rebuild_locked(&self, content: &mut Content) -> bool {
        for attempt in 1..=MAX_REBUILD_ATTEMPTS {
            if self.build_content(content) {
                if let Some(backing) = &content.backing {
                    backing.after_rebuild_success();
                }
                content.builders.notify_rebuild_success();
                debug!(
                    id = %self.id,
                    attempt,
                    rebuild_count = self.rebuild_count.load(Ordering::Relaxed),
                    "content rebuilt"
                );
                return true;
            }
            warn!(id = %self.id, attempt, "rebuild attempt failed");
        }
        let err = Error::RebuildFailed {
            attempts: MAX_REBUILD_ATTEMPTS,
        };
        error!(id = %self.id, error = %err, "giving up on rebuild");
        false
    }

    /// Zero the whole mapping, then run the chain over the declared size.
    fn build_content(&self, content: &mut Content) -> bool {
        let Some(backing) = content.backing.as_ref() else {
            return false;
        };
        let (ptr, map_len, size) = (backing.as_mut_ptr(), backing.map_len(), backing.len());
        // SAFETY: caller holds the content lock exclusively; the mapping is
        // `map_len` bytes long.
        let data = unsafe { std::slice::from_raw_parts_mut(ptr, map_len) };
        data.fill(0);
        if !content.builders.build_all(&mut data[..size]) {
            return false;
        }
        self.rebuild_count.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn pin_locked(&self, content: &Content) -> bool {
        let Some(backing) = content.backing.as_ref() else {
            return false;
        };
        if !backing.pin() {
            return false;
        }
        self.pins.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Re-take every pin held through the previous backing on `backing`.
    ///
    /// Only called with the content lock held exclusively, so no window is
    /// open and every outstanding pin belongs to a [`PurgeableResource::pin`]
    /// caller.
    fn carry_pins(&self, backing: &Backing) {
        let held = self.pins.load(Ordering::Acquire);
        let carried = (0..held).filter(|_| backing.pin()).count() as u32;
        if carried != held {
            warn!(id = %self.id, held, carried, "pins lost while replacing storage");
        }
        self.pins.store(carried, Ordering::Release);
    }

    /// Drop every outstanding pin from `backing`.
    fn release_pins(&self, backing: &Backing) {
        let held = self.pins.swap(0, Ordering::AcqRel);
        for _ in 0..held {
            backing.unpin();
        }
        if held > 0 {
            debug!(id = %self.id, held, "released outstanding pins");
        }
    }

    fn unpin_locked(&self, content: &Content) -> bool {
        let Some(backing) = content.backing.as_ref() else {
            return false;
        };
        if self
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            warn!(id = %self.id, "unpin without a matching pin");
            return false;
        }
        backing.unpin()
    }
}

// ============================================================================
// Storage management
// ============================================================================

impl PurgeableBuffer {
    /// Replace the backing with a fresh one of `new_size` bytes.
    ///
    /// Invalid sizes are rejected without touching the current storage. On
    /// success the content is unbuilt again (rebuild count reset to 0) and
    /// outstanding pins move to the new storage. Must not be called from a
    /// thread holding an open window.
    pub fn resize_data(&self, new_size: usize) -> Result<()> {
        if !is_valid_size(new_size) {
            warn!(id = %self.id, new_size, "resize rejected");
            return Err(Error::InvalidSize {
                size: new_size,
                max: MAX_PURGEABLE_SIZE,
            });
        }
        let mut content = self.content.write();
        self.publish(None);
        content.backing = None;
        self.rebuild_count.store(0, Ordering::Release);

        let backing = match Backing::allocate(content.kind, new_size, content.mode) {
            Ok(backing) => backing,
            Err(e) => {
                error!(id = %self.id, new_size, error = %e, "resize allocation failed");
                self.pins.store(0, Ordering::Release);
                return Err(e);
            }
        };
        self.carry_pins(&backing);
        self.publish(Some(&backing));
        content.backing = Some(backing);
        debug!(id = %self.id, new_size, "buffer resized");
        Ok(())
    }

    /// Replace the storage with a shared mapping owned by someone else.
    ///
    /// Storage this buffer owned is released first. The adopted mapping and
    /// descriptor are never unmapped or closed by this buffer. The adopted
    /// content counts as built, and outstanding pins move to it. A later
    /// rebuild writes only the first `size` bytes.
    ///
    /// # Safety
    /// `ptr` must be a live `MAP_SHARED` mapping of at least `size` bytes
    /// backed by `fd`, and both must outlive this buffer or the next
    /// resize/adopt, whichever comes first.
    pub unsafe fn adopt_shared_memory(&self, size: usize, fd: RawFd, ptr: *mut u8) -> Result<()> {
        if !is_valid_size(size) {
            warn!(id = %self.id, size, "adopt rejected");
            return Err(Error::InvalidSize {
                size,
                max: MAX_PURGEABLE_SIZE,
            });
        }
        let mut content = self.content.write();
        self.publish(None);
        content.backing = None;

        let region = match unsafe { SharedRegion::adopt(size, fd, ptr) } {
            Ok(region) => region,
            Err(e) => {
                self.pins.store(0, Ordering::Release);
                return Err(e);
            }
        };
        let backing = Backing::Shared(region);
        self.carry_pins(&backing);
        self.publish(Some(&backing));
        content.backing = Some(backing);
        content.kind = BackingKind::SharedFd;
        self.rebuild_count.fetch_add(1, Ordering::AcqRel);
        debug!(id = %self.id, size, fd, "shared memory adopted");
        Ok(())
    }

    /// Run the emulated reclaim scan over unpinned pages.
    ///
    /// Only anonymous buffers in [`PageTableMode::Emulated`] can lose pages
    /// this way; everything else returns 0.
    pub fn reclaim_unpinned(&self) -> usize {
        let content = self.content.read_recursive();
        content.backing.as_ref().map_or(0, Backing::reclaim_unpinned)
    }

    pub fn set_rebuild_success_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.content.write().builders.set_rebuild_success_callback(callback);
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl PurgeableBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Start of the content; null for a content-less buffer. Only valid to
    /// dereference inside an open window.
    pub fn content_ptr(&self) -> *mut u8 {
        self.content_ptr.load(Ordering::Acquire)
    }

    /// Declared content size in bytes.
    pub fn content_size(&self) -> usize {
        self.content_size.load(Ordering::Acquire)
    }

    pub fn has_content(&self) -> bool {
        !self.content_ptr().is_null()
    }

    /// Number of completed rebuilds since the storage was (re)allocated.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuild_count.load(Ordering::Acquire)
    }

    /// Outstanding pins held through this buffer.
    pub fn pin_status(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    pub fn set_data_valid(&self, valid: bool) {
        self.data.lock().valid = valid;
    }

    pub fn is_data_valid(&self) -> bool {
        self.data.lock().valid
    }

    /// Descriptor of a shared-descriptor buffer.
    pub fn shared_fd(&self) -> Option<RawFd> {
        self.content.read_recursive().backing.as_ref().and_then(Backing::shared_fd)
    }

    /// Read window gated on validity, held until
    /// [`end_read_with_data_lock`](Self::end_read_with_data_lock).
    pub fn begin_read_with_data_lock(&self) -> bool {
        let mut data = self.data.lock();
        if !data.valid || !self.begin_read_inner() {
            return false;
        }
        data.held_reads += 1;
        true
    }

    /// Close one window opened by
    /// [`begin_read_with_data_lock`](Self::begin_read_with_data_lock),
    /// whether or not the buffer was invalidated in between.
    pub fn end_read_with_data_lock(&self) {
        let mut data = self.data.lock();
        if data.held_reads == 0 {
            return;
        }
        data.held_reads -= 1;
        // SAFETY: `held_reads` counts shared holds opened above and never
        // exposed as content references.
        unsafe { self.end_read() };
    }
}

impl PurgeableResource for PurgeableBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn pin(&self) -> bool {
        let content = self.content.read_recursive();
        self.pin_locked(&content)
    }

    fn unpin(&self) -> bool {
        let content = self.content.read_recursive();
        self.unpin_locked(&content)
    }

    fn pin_status(&self) -> u32 {
        PurgeableBuffer::pin_status(self)
    }

    fn set_data_valid(&self, valid: bool) {
        PurgeableBuffer::set_data_valid(self, valid);
    }

    fn is_data_valid(&self) -> bool {
        PurgeableBuffer::is_data_valid(self)
    }

    fn begin_read_with_data_lock(&self) -> bool {
        PurgeableBuffer::begin_read_with_data_lock(self)
    }

    fn end_read_with_data_lock(&self) {
        PurgeableBuffer::end_read_with_data_lock(self);
    }
}

impl Drop for PurgeableBuffer {
    fn drop(&mut self) {
        let Some(backing) = self.content.get_mut().backing.take() else {
            return;
        };
        // Adopted storage outlives the buffer; leave no pins behind on it.
        self.release_pins(&backing);
        debug!(id = %self.id, kind = ?backing.kind(), size = backing.len(), "buffer released");
    }
}

impl fmt::Debug for PurgeableBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PurgeableBuffer")
            .field("id", &self.id)
            .field("content_ptr", &self.content_ptr())
            .field("content_size", &self.content_size())
            .field("rebuild_count", &self.rebuild_count())
            .field("pins", &self.pin_status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alphabet() -> Box<dyn PurgeableBuilder> {
        Box::new(|data: &mut [u8]| {
            for (i, b) in data.iter_mut().enumerate() {
                *b = b'A' + (i % 26) as u8;
            }
            true
        })
    }

    #[test]
    fn test_first_read_builds() {
        let buffer = PurgeableBuffer::with_page_table_mode(26, alphabet(), PageTableMode::Disabled);
        assert_eq!(buffer.rebuild_count(), 0);
        assert_eq!(buffer.content_size(), 26);

        assert!(buffer.begin_read());
        let data = unsafe { std::slice::from_raw_parts(buffer.content_ptr(), buffer.content_size()) };
        assert_eq!(data, b"ABCDEFGHIJKLMNOPQRSTUVWXYZ");
        unsafe { buffer.end_read() };

        assert_eq!(buffer.rebuild_count(), 1);
        assert_eq!(buffer.pin_status(), 0);
    }

    #[test]
    fn test_mismatched_end_is_ignored() {
        let buffer = PurgeableBuffer::with_page_table_mode(8, alphabet(), PageTableMode::Disabled);
        unsafe {
            buffer.end_read();
            buffer.end_write();
        }

        // Lock is still usable.
        assert!(buffer.begin_write());
        unsafe { buffer.end_write() };
        assert!(buffer.begin_read());
        unsafe { buffer.end_read() };
    }

    #[test]
    fn test_modify_requires_write_window() {
        let buffer = PurgeableBuffer::with_page_table_mode(8, alphabet(), PageTableMode::Disabled);
        assert!(!unsafe { buffer.modify_content_by_builder(Box::new(|_: &mut [u8]| true)) });

        assert!(buffer.begin_read());
        assert!(!unsafe { buffer.modify_content_by_builder(Box::new(|_: &mut [u8]| true)) });
        unsafe { buffer.end_read() };
    }

    #[test]
    fn test_failed_modify_leaves_chain_alone() {
        let buffer = PurgeableBuffer::with_page_table_mode(4, alphabet(), PageTableMode::Disabled);
        let mut guard = buffer.write().unwrap();
        assert!(!guard.modify(Box::new(|_: &mut [u8]| false)));
        drop(guard);
        assert_eq!(buffer.content.read().builders.len(), 1);
    }

    #[test]
    fn test_invalid_buffer_fails_closed() {
        let buffer = PurgeableBuffer::with_page_table_mode(8, alphabet(), PageTableMode::Disabled);
        buffer.set_data_valid(false);
        assert!(!buffer.is_data_valid());
        assert!(!buffer.begin_read());
        assert!(!buffer.begin_write());
        assert!(!buffer.begin_read_with_data_lock());
        assert_eq!(buffer.pin_status(), 0);
    }

    #[test]
    fn test_data_lock_window_survives_invalidation() {
        let buffer = PurgeableBuffer::with_page_table_mode(8, alphabet(), PageTableMode::Disabled);
        assert!(buffer.begin_read_with_data_lock());
        assert_eq!(buffer.pin_status(), 1);

        buffer.set_data_valid(false);
        buffer.end_read_with_data_lock();
        assert_eq!(buffer.pin_status(), 0);

        // A second end is a no-op.
        buffer.end_read_with_data_lock();
        assert_eq!(buffer.pin_status(), 0);
    }

    #[test]
    fn test_zero_size_is_content_less() {
        assert!(matches!(
            PurgeableBuffer::try_with_page_table_mode(0, alphabet(), PageTableMode::Disabled),
            Err(Error::InvalidSize { size: 0, .. })
        ));
        let buffer = PurgeableBuffer::with_page_table_mode(0, alphabet(), PageTableMode::Disabled);
        assert!(!buffer.has_content());
        assert!(!buffer.begin_read());
        assert!(buffer.read().is_none());
    }

    #[test]
    fn test_resize_resets_rebuild_count() {
        let buffer = PurgeableBuffer::with_page_table_mode(4, alphabet(), PageTableMode::Disabled);
        drop(buffer.read());
        assert_eq!(buffer.rebuild_count(), 1);

        buffer.resize_data(30).unwrap();
        assert_eq!(buffer.rebuild_count(), 0);
        assert_eq!(buffer.content_size(), 30);

        let guard = buffer.read().unwrap();
        assert_eq!(&guard[26..], b"ABCD");
        drop(guard);
        assert_eq!(buffer.rebuild_count(), 1);
    }

    #[test]
    fn test_resize_keeps_outstanding_pins() {
        let buffer = PurgeableBuffer::with_page_table_mode(4, alphabet(), PageTableMode::Emulated);
        assert!(PurgeableResource::pin(&buffer));

        buffer.resize_data(2 * 4096).unwrap();
        assert_eq!(buffer.pin_status(), 1);
        drop(buffer.read());
        assert_eq!(buffer.reclaim_unpinned(), 0);

        assert!(PurgeableResource::unpin(&buffer));
        assert_eq!(buffer.pin_status(), 0);
        assert_eq!(buffer.reclaim_unpinned(), 2);
    }

    #[test]
    fn test_rejected_resize_keeps_pins() {
        let buffer = PurgeableBuffer::with_page_table_mode(4, alphabet(), PageTableMode::Emulated);
        assert!(PurgeableResource::pin(&buffer));
        assert!(buffer.resize_data(MAX_PURGEABLE_SIZE).is_err());
        // Rejected sizes leave storage and pins alone.
        assert_eq!(buffer.pin_status(), 1);
    }

    #[test]
    fn test_release_pins_returns_pages_to_reclaim() {
        let buffer = PurgeableBuffer::with_page_table_mode(4, alphabet(), PageTableMode::Emulated);
        drop(buffer.read());
        assert!(PurgeableResource::pin(&buffer));
        assert!(PurgeableResource::pin(&buffer));
        assert_eq!(buffer.reclaim_unpinned(), 0);

        {
            let content = buffer.content.read();
            buffer.release_pins(content.backing.as_ref().unwrap());
        }
        assert_eq!(buffer.pin_status(), 0);
        assert_eq!(buffer.reclaim_unpinned(), 1);
    }

    #[test]
    fn test_write_guard_excludes_other_writers() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;
        use std::time::Duration;

        let buffer = Arc::new(PurgeableBuffer::with_page_table_mode(8, alphabet(), PageTableMode::Disabled));
        let mut guard = buffer.write().unwrap();

        let entered = Arc::new(AtomicBool::new(false));
        let second = {
            let buffer = Arc::clone(&buffer);
            let entered = Arc::clone(&entered);
            std::thread::spawn(move || {
                let mut other = buffer.write().unwrap();
                entered.store(true, Ordering::SeqCst);
                other[0] = b'y';
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        guard[0] = b'x';
        assert_eq!(guard[0], b'x');
        drop(guard);

        second.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert_eq!(buffer.read().unwrap()[0], b'y');
    }

    #[test]
    fn test_rebuild_callback_fires() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let buffer = PurgeableBuffer::with_page_table_mode(4, alphabet(), PageTableMode::Emulated);
        buffer.set_rebuild_success_callback(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        drop(buffer.read());
        assert_eq!(buffer.reclaim_unpinned(), 1);
        drop(buffer.read());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
