//! RAII guards for buffer access windows.
//!
//! - [`ReadGuard`] - shared read window (many at once)
//! - [`WriteGuard`] - exclusive write window
//!
//! Both deref to exactly the declared content and close their window when
//! dropped.

use std::ops::{Deref, DerefMut};

use super::builder::PurgeableBuilder;
use super::purgeable_buffer::PurgeableBuffer;

/// Guard for a read window.
///
/// # Example
/// ```ignore
/// let guard = buffer.read()?;
/// let first = guard[0];   // Deref to &[u8]
/// // guard drops here, window closed
/// ```
pub struct ReadGuard<'a> {
    buffer: &'a PurgeableBuffer,
    ptr: *const u8,
    len: usize,
}

impl<'a> ReadGuard<'a> {
    /// Called by `PurgeableBuffer::read()` after a successful `begin_read`.
    pub(crate) fn new(buffer: &'a PurgeableBuffer, ptr: *const u8, len: usize) -> Self {
        Self { buffer, ptr, len }
    }

    #[inline]
    pub fn buffer(&self) -> &PurgeableBuffer {
        self.buffer
    }
}

impl Deref for ReadGuard<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        // SAFETY: the open window keeps the mapping alive and resident.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard owns the read window and its borrows end here.
        unsafe { self.buffer.end_read() };
    }
}

/// Guard for a write window.
///
/// # Example
/// ```ignore
/// let mut guard = buffer.write()?;
/// guard[0] = b'B';   // DerefMut to &mut [u8]
/// // guard drops here, window closed
/// ```
pub struct WriteGuard<'a> {
    buffer: &'a PurgeableBuffer,
    ptr: *mut u8,
    len: usize,
}

impl<'a> WriteGuard<'a> {
    /// Called by `PurgeableBuffer::write()` after a successful `begin_write`.
    pub(crate) fn new(buffer: &'a PurgeableBuffer, ptr: *mut u8, len: usize) -> Self {
        Self { buffer, ptr, len }
    }

    /// Apply `builder` now and record it for every later rebuild.
    ///
    /// Plain writes through `DerefMut` are lost on the next purge; changes
    /// that must survive go through here.
    pub fn modify(&mut self, builder: Box<dyn PurgeableBuilder>) -> bool {
        // SAFETY: the guard owns the write window, and `&mut self` means no
        // slice borrowed from it is alive.
        unsafe { self.buffer.modify_content_by_builder(builder) }
    }

    #[inline]
    pub fn buffer(&self) -> &PurgeableBuffer {
        self.buffer
    }
}

impl Deref for WriteGuard<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        // SAFETY: the open window holds the content lock exclusively.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for WriteGuard<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` rules out aliasing through the guard.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard owns the write window and its borrows end here.
        unsafe { self.buffer.end_write() };
    }
}
