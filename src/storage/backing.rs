//! Backing storage variants behind a purgeable buffer.

use std::os::fd::RawFd;

use crate::common::Result;

use super::anon::AnonRegion;
use super::page_table::PageTableMode;
use super::shared_fd::SharedRegion;

/// Which backing a buffer allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    /// Anonymous mapping tracked by a user-extended page table.
    Anonymous,
    /// Shared memory descriptor with per-descriptor purgeable control.
    SharedFd,
}

/// Storage of a buffer, with the four primitives the access protocol
/// drives: pin, unpin, purge query and rebuild acknowledgement.
#[derive(Debug)]
pub enum Backing {
    Anon(AnonRegion),
    Shared(SharedRegion),
}

impl Backing {
    /// Allocate a backing of `kind` holding `size` bytes.
    pub fn allocate(kind: BackingKind, size: usize, mode: PageTableMode) -> Result<Self> {
        match kind {
            BackingKind::Anonymous => AnonRegion::new(size, mode).map(Backing::Anon),
            BackingKind::SharedFd => SharedRegion::create(size).map(Backing::Shared),
        }
    }

    pub fn kind(&self) -> BackingKind {
        match self {
            Backing::Anon(_) => BackingKind::Anonymous,
            Backing::Shared(_) => BackingKind::SharedFd,
        }
    }

    pub fn pin(&self) -> bool {
        match self {
            Backing::Anon(r) => r.pin(),
            Backing::Shared(r) => r.pin(),
        }
    }

    pub fn unpin(&self) -> bool {
        match self {
            Backing::Anon(r) => r.unpin(),
            Backing::Shared(r) => r.unpin(),
        }
    }

    pub fn is_purged(&self) -> bool {
        match self {
            Backing::Anon(r) => r.is_purged(),
            Backing::Shared(r) => r.is_purged(),
        }
    }

    pub fn after_rebuild_success(&self) {
        match self {
            Backing::Anon(r) => r.after_rebuild_success(),
            Backing::Shared(r) => r.after_rebuild_success(),
        }
    }

    /// Emulated reclaim pass; only anonymous backings in emulated mode do
    /// anything.
    pub fn reclaim_unpinned(&self) -> usize {
        match self {
            Backing::Anon(r) => r.reclaim_unpinned(),
            Backing::Shared(_) => 0,
        }
    }

    pub fn shared_fd(&self) -> Option<RawFd> {
        match self {
            Backing::Anon(_) => None,
            Backing::Shared(r) => Some(r.raw_fd()),
        }
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        match self {
            Backing::Anon(r) => r.as_mut_ptr(),
            Backing::Shared(r) => r.as_mut_ptr(),
        }
    }

    /// Declared size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Backing::Anon(r) => r.len(),
            Backing::Shared(r) => r.len(),
        }
    }

    /// Mapped size in bytes (whole pages).
    pub fn map_len(&self) -> usize {
        match self {
            Backing::Anon(r) => r.map_len(),
            Backing::Shared(r) => r.map_len(),
        }
    }
}
