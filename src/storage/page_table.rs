//! User-extended page table (UXPT).
//!
//! One 64-bit counter per 4KB page of a tracked region, shared with the
//! kernel reclaim scan:
//!
//! ```text
//!  63                                                 1   0
//! ┌────────────────────────────────────────────────────┬───┐
//! │              reference count (units of 2)           │ P │
//! └────────────────────────────────────────────────────┴───┘
//!   P = 1: page present     P = 0: page reclaimed
//!   0xFFFF_FFFF_FFFF_FFFE (-2): page is under a reclaim scan
//! ```
//!
//! Pinning a page adds [`REFCNT_ONE`]; the kernel only reclaims pages whose
//! reference count is zero, and marks them [`UNDER_RECLAIM`] while it does.
//! A pin that lands on that sentinel spins until the scan is over.
//!
//! Three backings are supported (see [`PageTableMode`]): the kernel-shared
//! table, a heap-backed emulation with a user-space reclaim scan, and a
//! disabled mode in which every operation is a no-op and every page is present.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use tracing::{debug, error};

use crate::common::config::{round_down, round_up, PAGE_SHIFT, PAGE_SIZE};
use crate::common::{Error, Result};

/// Presence bit of an entry.
pub const PRESENT_BIT: u64 = 1;

/// One pin reference.
pub const REFCNT_ONE: u64 = 1 << 1;

/// Reserved entry value while the page is being reclaimed.
pub const UNDER_RECLAIM: u64 = REFCNT_ONE.wrapping_neg();

/// mmap flag asking the kernel for the user-extended page table of a range.
const MAP_USEREXPTE: libc::c_int = 0x80;

/// Marker file exposed by kernels with purgeable memory support.
const PURGEABLE_SYSCTL: &str = "/proc/sys/kernel/purgeable";

const UXPTE_SIZE_SHIFT: usize = 3;
const UXPTE_PER_PAGE_SHIFT: usize = PAGE_SHIFT - UXPTE_SIZE_SHIFT;
const UXPTE_PER_PAGE: usize = 1 << UXPTE_PER_PAGE_SHIFT;

#[inline]
fn virt_page_no(vaddr: usize) -> usize {
    vaddr >> PAGE_SHIFT
}

/// Page of the kernel table holding the entry for `vaddr`.
#[inline]
fn uxpte_page_no(vaddr: usize) -> usize {
    virt_page_no(vaddr) >> UXPTE_PER_PAGE_SHIFT
}

/// Offset of the entry for `vaddr` within its table page.
#[inline]
fn uxpte_offset(vaddr: usize) -> usize {
    virt_page_no(vaddr) & (UXPTE_PER_PAGE - 1)
}

/// Decoded view of one page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UxpteState {
    /// Page is resident, pinned `refs` times.
    Present { refs: u64 },
    /// Page was reclaimed, pinned `refs` times since.
    Absent { refs: u64 },
    /// Kernel (or emulated) reclaim scan is working on this page.
    UnderReclaim,
}

impl UxpteState {
    /// Decode a raw entry value.
    #[inline]
    pub fn decode(raw: u64) -> Self {
        if raw == UNDER_RECLAIM {
            return UxpteState::UnderReclaim;
        }
        let refs = raw >> 1;
        if raw & PRESENT_BIT != 0 {
            UxpteState::Present { refs }
        } else {
            UxpteState::Absent { refs }
        }
    }

    /// Encode back into the raw entry value.
    #[inline]
    pub fn encode(self) -> u64 {
        match self {
            UxpteState::Present { refs } => (refs << 1) | PRESENT_BIT,
            UxpteState::Absent { refs } => refs << 1,
            UxpteState::UnderReclaim => UNDER_RECLAIM,
        }
    }

    /// Number of pins on the page (zero while under reclaim).
    #[inline]
    pub fn refs(self) -> u64 {
        match self {
            UxpteState::Present { refs } | UxpteState::Absent { refs } => refs,
            UxpteState::UnderReclaim => 0,
        }
    }
}

/// How presence and pin counts are tracked for an anonymous buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableMode {
    /// Table shared with the kernel through a `MAP_USEREXPTE` mapping.
    Kernel,
    /// Heap-backed table; reclaim runs in user space via
    /// [`UxPageTable::reclaim_unpinned`].
    Emulated,
    /// No tracking. Pages are always reported present.
    Disabled,
}

impl PageTableMode {
    /// `Kernel` when the running kernel supports purgeable memory, `Disabled`
    /// otherwise. Probed once per process.
    pub fn detect() -> Self {
        static SUPPORTED: OnceLock<bool> = OnceLock::new();
        let supported = *SUPPORTED.get_or_init(|| {
            let present = std::path::Path::new(PURGEABLE_SYSCTL).exists();
            debug!(present, "probed kernel purgeable memory support");
            present
        });
        if supported {
            PageTableMode::Kernel
        } else {
            PageTableMode::Disabled
        }
    }
}

enum Entries {
    Kernel {
        ptes: NonNull<AtomicU64>,
        map_len: usize,
        /// Index of the first tracked page inside the mapping.
        base: usize,
        count: usize,
    },
    Emulated(Box<[AtomicU64]>),
    Disabled,
}

/// Per-page pin and presence table for one anonymous mapping.
pub struct UxPageTable {
    data_addr: usize,
    data_size: usize,
    entries: Entries,
}

// SAFETY: the kernel mapping is only accessed through atomics and is owned
// exclusively by this table until `Drop` unmaps it.
unsafe impl Send for UxPageTable {}
unsafe impl Sync for UxPageTable {}

impl UxPageTable {
    /// Create a table covering every page of `[addr, addr + len)`.
    ///
    /// `addr` must be page aligned.
    ///
    /// # Errors
    /// Returns an error if the kernel table cannot be mapped; the owning
    /// buffer must then be treated as unusable.
    pub fn new(addr: usize, len: usize, mode: PageTableMode) -> Result<Self> {
        let data_size = round_up(len, PAGE_SIZE).ok_or(Error::InvalidSize {
            size: len,
            max: usize::MAX,
        })?;
        let pages = data_size / PAGE_SIZE;

        let entries = match mode {
            PageTableMode::Disabled => Entries::Disabled,
            PageTableMode::Emulated => Entries::Emulated(
                (0..pages).map(|_| AtomicU64::new(PRESENT_BIT)).collect(),
            ),
            PageTableMode::Kernel => map_kernel_entries(addr, data_size)?,
        };

        Ok(Self {
            data_addr: addr,
            data_size,
            entries,
        })
    }

    /// The tracking mode of this table.
    pub fn mode(&self) -> PageTableMode {
        match self.entries {
            Entries::Kernel { .. } => PageTableMode::Kernel,
            Entries::Emulated(_) => PageTableMode::Emulated,
            Entries::Disabled => PageTableMode::Disabled,
        }
    }

    /// Whether the table tracks anything at all.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        !matches!(self.entries, Entries::Disabled)
    }

    /// Pin every page of `[addr, addr + len)`.
    ///
    /// Spins (yielding) on pages that are under a reclaim scan.
    pub fn get(&self, addr: usize, len: usize) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        for entry in self.range(addr, len)? {
            add_ref(entry);
        }
        Ok(())
    }

    /// Drop one pin from every page of `[addr, addr + len)`.
    ///
    /// The caller must hold a prior [`get`](Self::get) on the range.
    pub fn put(&self, addr: usize, len: usize) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        for entry in self.range(addr, len)? {
            entry.fetch_sub(REFCNT_ONE, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Whether every page of `[addr, addr + len)` is resident.
    ///
    /// Out-of-range requests report `false`.
    pub fn is_present(&self, addr: usize, len: usize) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let entries = match self.range(addr, len) {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "presence check rejected");
                return false;
            }
        };
        for (i, entry) in entries.enumerate() {
            let raw = entry.load(Ordering::Acquire);
            if !matches!(UxpteState::decode(raw), UxpteState::Present { .. }) {
                debug!(page = i, raw = format_args!("{raw:#x}"), "page not present");
                return false;
            }
        }
        true
    }

    /// Mark every page of the range present again after a rebuild.
    ///
    /// Only meaningful for the emulated table; the kernel maintains presence
    /// itself when a reclaimed page is faulted back in.
    pub fn mark_present(&self, addr: usize, len: usize) -> Result<()> {
        if let Entries::Emulated(_) = self.entries {
            for entry in self.range(addr, len)? {
                entry.fetch_or(PRESENT_BIT, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    /// Run one emulated reclaim scan: every present page with no pins is
    /// dropped (zero-filled on next touch) and marked absent.
    ///
    /// Returns the number of pages reclaimed. Does nothing unless the table
    /// is [`PageTableMode::Emulated`].
    pub fn reclaim_unpinned(&self) -> usize {
        let Entries::Emulated(ref ptes) = self.entries else {
            return 0;
        };
        let mut reclaimed = 0;
        for (i, entry) in ptes.iter().enumerate() {
            if entry
                .compare_exchange(PRESENT_BIT, UNDER_RECLAIM, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let page = (self.data_addr + i * PAGE_SIZE) as *mut std::ffi::c_void;
            // SAFETY: the owning buffer keeps the data mapping alive for as
            // long as this table exists, and the page has no pins.
            let res = unsafe { rustix::mm::madvise(page, PAGE_SIZE, rustix::mm::Advice::LinuxDontNeed) };
            if let Err(e) = res {
                error!(error = %e, page = i, "madvise during emulated reclaim failed");
            }
            entry.store(0, Ordering::Release);
            reclaimed += 1;
        }
        debug!(reclaimed, "emulated reclaim scan finished");
        reclaimed
    }

    /// Decoded state of the page containing `addr`, if tracked.
    pub fn state_at(&self, addr: usize) -> Option<UxpteState> {
        if !self.is_enabled() {
            return None;
        }
        self.range(addr, 1)
            .ok()?
            .next()
            .map(|entry| UxpteState::decode(entry.load(Ordering::Acquire)))
    }

    /// Start address of the tracked region.
    pub fn data_addr(&self) -> usize {
        self.data_addr
    }

    /// Page-rounded size of the tracked region.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Entries for the pages of `[addr, addr + len)`, after the range check.
    fn range(&self, addr: usize, len: usize) -> Result<impl Iterator<Item = &AtomicU64>> {
        let start = round_down(addr, PAGE_SIZE);
        let end = addr
            .checked_add(len)
            .and_then(|e| round_up(e, PAGE_SIZE))
            .unwrap_or(usize::MAX);
        let region_end = self.data_addr + self.data_size;
        if start < self.data_addr || end > region_end {
            return Err(Error::OutOfRange {
                start,
                end,
                region_start: self.data_addr,
                region_end,
            });
        }

        let first = virt_page_no(start) - virt_page_no(self.data_addr);
        let count = (end - start) >> PAGE_SHIFT;
        let slice: &[AtomicU64] = match &self.entries {
            Entries::Kernel {
                ptes,
                base,
                count: tracked,
                ..
            } => {
                // SAFETY: the mapping holds `base + tracked` entries and lives
                // until `Drop`.
                unsafe { std::slice::from_raw_parts(ptes.as_ptr().add(*base), *tracked) }
            }
            Entries::Emulated(ptes) => &ptes[..],
            Entries::Disabled => &[],
        };
        Ok(slice[first..first + count].iter())
    }
}

impl Drop for UxPageTable {
    fn drop(&mut self) {
        if let Entries::Kernel { ptes, map_len, .. } = self.entries {
            // SAFETY: mapped in `map_kernel_entries` with this length.
            let res = unsafe { rustix::mm::munmap(ptes.as_ptr().cast(), map_len) };
            if let Err(e) = res {
                error!(error = %e, "unmap of page table failed");
            }
        }
    }
}

impl std::fmt::Debug for UxPageTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UxPageTable")
            .field("data_addr", &format_args!("{:#x}", self.data_addr))
            .field("data_size", &self.data_size)
            .field("mode", &self.mode())
            .finish()
    }
}

fn add_ref(entry: &AtomicU64) {
    loop {
        let old = entry.load(Ordering::Acquire);
        if old == UNDER_RECLAIM {
            std::thread::yield_now();
            continue;
        }
        if entry
            .compare_exchange_weak(old, old.wrapping_add(REFCNT_ONE), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

fn map_kernel_entries(addr: usize, data_size: usize) -> Result<Entries> {
    let first_table_page = uxpte_page_no(addr);
    let last_table_page = uxpte_page_no(addr + data_size - 1);
    let map_len = (last_table_page - first_table_page + 1) * PAGE_SIZE;
    let offset = (first_table_page * PAGE_SIZE) as libc::off_t;

    // SAFETY: anonymous mapping request; the kernel interprets the offset as
    // the first table page for MAP_USEREXPTE.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            map_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_USEREXPTE,
            -1,
            offset,
        )
    };
    if ptr == libc::MAP_FAILED {
        let err = std::io::Error::last_os_error();
        error!(error = %err, map_len, "mapping user-extended page table failed");
        return Err(Error::Io(err));
    }
    let ptes = NonNull::new(ptr.cast::<AtomicU64>()).ok_or(Error::NoContent)?;

    Ok(Entries::Kernel {
        ptes,
        map_len,
        base: uxpte_offset(addr),
        count: data_size / PAGE_SIZE,
    })
}
