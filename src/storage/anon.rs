//! Anonymous-mapping backing.
//!
//! A private anonymous mapping, created with the kernel's purgeable flag when
//! the page table runs in kernel mode. Pins go through the [`UxPageTable`]
//! over the declared length of the buffer.

use std::ptr::NonNull;

use rustix::mm::{MapFlags, ProtFlags};
use tracing::{debug, error};

use crate::common::config::{round_up, PAGE_SIZE};
use crate::common::{Error, Result};

use super::page_table::{PageTableMode, UxPageTable};

/// mmap flag marking an anonymous mapping as kernel-reclaimable.
const MAP_PURGEABLE: u32 = 0x04;

/// Anonymous purgeable region with its page table.
pub struct AnonRegion {
    ptr: NonNull<u8>,
    map_len: usize,
    size: usize,
    page_table: UxPageTable,
}

// SAFETY: the mapping is owned by this region and unmapped only in `Drop`;
// all shared bookkeeping goes through the page table's atomics.
unsafe impl Send for AnonRegion {}
unsafe impl Sync for AnonRegion {}

impl AnonRegion {
    /// Map `size` bytes (rounded up to whole pages) and build its page table.
    pub fn new(size: usize, mode: PageTableMode) -> Result<Self> {
        let map_len = round_up(size, PAGE_SIZE).ok_or(Error::InvalidSize {
            size,
            max: usize::MAX,
        })?;

        let mut flags = MapFlags::PRIVATE;
        if mode == PageTableMode::Kernel {
            flags |= MapFlags::from_bits_retain(MAP_PURGEABLE);
        }

        let raw = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                map_len,
                ProtFlags::READ | ProtFlags::WRITE,
                flags,
            )
        }
        .map_err(|e| {
            error!(error = %e, size, "anonymous mmap failed");
            Error::System(e)
        })?;
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or(Error::NoContent)?;

        let page_table = match UxPageTable::new(ptr.as_ptr() as usize, map_len, mode) {
            Ok(table) => table,
            Err(e) => {
                // SAFETY: mapped just above with this length.
                unsafe {
                    let _ = rustix::mm::munmap(raw, map_len);
                }
                return Err(e);
            }
        };

        debug!(size, map_len, ?mode, "anonymous region created");
        Ok(Self {
            ptr,
            map_len,
            size,
            page_table,
        })
    }

    pub fn pin(&self) -> bool {
        match self.page_table.get(self.addr(), self.size) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "page table get failed");
                false
            }
        }
    }

    pub fn unpin(&self) -> bool {
        match self.page_table.put(self.addr(), self.size) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "page table put failed");
                false
            }
        }
    }

    /// True iff any page of the buffer has been reclaimed.
    pub fn is_purged(&self) -> bool {
        !self.page_table.is_present(self.addr(), self.size)
    }

    pub fn after_rebuild_success(&self) {
        if let Err(e) = self.page_table.mark_present(self.addr(), self.size) {
            error!(error = %e, "marking rebuilt pages present failed");
        }
    }

    /// Emulated reclaim pass over unpinned pages. See
    /// [`UxPageTable::reclaim_unpinned`].
    pub fn reclaim_unpinned(&self) -> usize {
        self.page_table.reclaim_unpinned()
    }

    pub fn page_table(&self) -> &UxPageTable {
        &self.page_table
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Declared size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Page-rounded mapped size.
    pub fn map_len(&self) -> usize {
        self.map_len
    }

    #[inline]
    fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl Drop for AnonRegion {
    fn drop(&mut self) {
        // SAFETY: mapped in `new` with `map_len`; no window can be open
        // because the owning buffer is being torn down.
        let res = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.map_len) };
        match res {
            Ok(()) => debug!(map_len = self.map_len, "anonymous region unmapped"),
            Err(e) => error!(error = %e, "munmap of anonymous region failed"),
        }
    }
}

impl std::fmt::Debug for AnonRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnonRegion")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("map_len", &self.map_len)
            .field("page_table", &self.page_table)
            .finish()
    }
}
