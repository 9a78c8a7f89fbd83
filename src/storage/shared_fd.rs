//! Shared-descriptor backing.
//!
//! Storage is a shared memory descriptor (`/dev/ashmem` when the device
//! exists, a memfd otherwise) mapped `MAP_SHARED`. Purgeable control is
//! per-descriptor and coarse: pin and unpin cover the whole region through
//! device controls, and the kernel reports purge state for the descriptor as
//! a whole. Descriptors without purgeable support are always resident.

use std::ffi::{c_void, CString};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

use rustix::fs::{MemfdFlags, Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use tracing::{debug, error, warn};

use crate::common::config::{round_up, PAGE_SIZE};
use crate::common::{Error, Result};

const ASHMEM_DEVICE: &str = "/dev/ashmem";
const ASHMEM_NAME: &str = "PurgeableAshmem";
const ASHMEM_NAME_LEN: usize = 256;

// ============================================================================
// Device controls
// ============================================================================

const ASHMEM_IOC: u32 = 0x77;
const IOC_WRITE: u32 = 1;

const fn io(nr: u32) -> libc::c_ulong {
    ((ASHMEM_IOC << 8) | nr) as libc::c_ulong
}

const fn iow(nr: u32, size: usize) -> libc::c_ulong {
    ((IOC_WRITE << 30) | ((size as u32) << 16) | (ASHMEM_IOC << 8) | nr) as libc::c_ulong
}

/// Pin range; `{0, 0}` covers the whole region.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct AshmemPin {
    offset: u32,
    len: u32,
}

const ASHMEM_SET_NAME: libc::c_ulong = iow(1, ASHMEM_NAME_LEN);
const ASHMEM_SET_SIZE: libc::c_ulong = iow(3, std::mem::size_of::<libc::size_t>());
const ASHMEM_SET_PROT_MASK: libc::c_ulong = iow(5, std::mem::size_of::<libc::c_ulong>());
const ASHMEM_PIN: libc::c_ulong = iow(7, std::mem::size_of::<AshmemPin>());
const ASHMEM_UNPIN: libc::c_ulong = iow(8, std::mem::size_of::<AshmemPin>());
const ASHMEM_GET_PIN_STATUS: libc::c_ulong = io(9);
const ASHMEM_SET_PURGEABLE: libc::c_ulong = io(11);
const ASHMEM_GET_PURGEABLE: libc::c_ulong = io(12);
const PURGEABLE_ASHMEM_IS_PURGED: libc::c_ulong = io(13);
const PURGEABLE_ASHMEM_REBUILD_SUCCESS: libc::c_ulong = io(14);

/// `ioctl` retried across `EINTR`.
fn ioctl(fd: RawFd, request: libc::c_ulong, arg: *mut c_void) -> io::Result<libc::c_int> {
    loop {
        // SAFETY: every request used here takes either no argument or a
        // pointer to a live value of the size encoded in the request.
        let ret = unsafe { libc::ioctl(fd, request as _, arg) };
        if ret >= 0 {
            return Ok(ret);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

// ============================================================================
// Region
// ============================================================================

/// Who closes the descriptor and unmaps the region.
#[derive(Debug)]
enum Ownership {
    /// Created here; unmapped and closed on drop.
    Owned(OwnedFd),
    /// Adopted from another subsystem, which keeps ownership of both the
    /// descriptor and the mapping. Nothing is released on drop.
    Adopted(RawFd),
}

/// A mapped shared memory descriptor with purgeable control.
pub struct SharedRegion {
    ownership: Ownership,
    ptr: NonNull<u8>,
    map_len: usize,
    size: usize,
    /// Set when the kernel accepted `ASHMEM_SET_PURGEABLE`.
    purgeable: bool,
    pin_range: AshmemPin,
}

// SAFETY: the mapping is shared memory reachable from any thread; the region
// only hands out its pointer and issues device controls on its descriptor.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create and map a new descriptor of `size` bytes (rounded to pages),
    /// probe purgeable support and leave it unpinned.
    pub fn create(size: usize) -> Result<Self> {
        let map_len = round_up(size, PAGE_SIZE).ok_or(Error::InvalidSize {
            size,
            max: usize::MAX,
        })?;

        let fd = match open_ashmem(map_len) {
            Ok(fd) => fd,
            Err(e) => {
                debug!(error = %e, "ashmem device unavailable, falling back to memfd");
                open_memfd(map_len)?
            }
        };

        let raw = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                map_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| {
            error!(error = %e, size, "mmap of shared descriptor failed");
            Error::System(e)
        })?;
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or(Error::NoContent)?;

        let mut region = Self {
            ownership: Ownership::Owned(fd),
            ptr,
            map_len,
            size,
            purgeable: false,
            pin_range: AshmemPin::default(),
        };
        region.probe_purgeable();
        region.unpin();
        debug!(fd = region.raw_fd(), size, purgeable = region.purgeable, "shared region created");
        Ok(region)
    }

    /// Wrap a descriptor and mapping created elsewhere.
    ///
    /// The region never unmaps `ptr` nor closes `fd`; the caller keeps that
    /// responsibility. Only the first `size` bytes are treated as mapped,
    /// so [`map_len`](Self::map_len) equals [`len`](Self::len).
    ///
    /// # Safety
    /// `ptr` must be a live shared mapping of at least `size` bytes backed by
    /// `fd`, and both must outlive the returned region.
    pub unsafe fn adopt(size: usize, fd: RawFd, ptr: *mut u8) -> Result<Self> {
        let ptr = NonNull::new(ptr).ok_or(Error::NoContent)?;
        if fd < 0 {
            return Err(Error::Io(io::Error::from_raw_os_error(libc::EBADF)));
        }
        let mut region = Self {
            ownership: Ownership::Adopted(fd),
            ptr,
            map_len: size,
            size,
            purgeable: false,
            pin_range: AshmemPin::default(),
        };
        region.probe_purgeable();
        region.unpin();
        debug!(fd, size, purgeable = region.purgeable, "shared region adopted");
        Ok(region)
    }

    fn probe_purgeable(&mut self) {
        let fd = self.raw_fd();
        if let Err(e) = ioctl(fd, ASHMEM_SET_PURGEABLE, std::ptr::null_mut()) {
            debug!(fd, error = %e, "descriptor does not accept purgeable control");
        }
        self.purgeable = matches!(ioctl(fd, ASHMEM_GET_PURGEABLE, std::ptr::null_mut()), Ok(1));
    }

    pub fn pin(&self) -> bool {
        self.pin_control(ASHMEM_PIN, "pin")
    }

    pub fn unpin(&self) -> bool {
        self.pin_control(ASHMEM_UNPIN, "unpin")
    }

    fn pin_control(&self, request: libc::c_ulong, op: &'static str) -> bool {
        if !self.purgeable {
            return true;
        }
        let mut range = self.pin_range;
        match ioctl(self.raw_fd(), request, (&mut range as *mut AshmemPin).cast()) {
            Ok(_) => {
                debug!(fd = self.raw_fd(), op, pin_status = self.pin_status(), "pin control");
                true
            }
            Err(e) => {
                warn!(fd = self.raw_fd(), op, error = %e, "pin control failed");
                false
            }
        }
    }

    /// Kernel pin counter for the descriptor; 0 when unsupported.
    pub fn pin_status(&self) -> i32 {
        if !self.purgeable {
            return 0;
        }
        let mut range = self.pin_range;
        ioctl(self.raw_fd(), ASHMEM_GET_PIN_STATUS, (&mut range as *mut AshmemPin).cast())
            .unwrap_or(0)
    }

    pub fn is_purged(&self) -> bool {
        if !self.purgeable {
            return false;
        }
        match ioctl(self.raw_fd(), PURGEABLE_ASHMEM_IS_PURGED, std::ptr::null_mut()) {
            Ok(ret) => ret > 0,
            Err(e) => {
                warn!(fd = self.raw_fd(), error = %e, "purge query failed");
                false
            }
        }
    }

    /// Tell the kernel the content was just rebuilt and is authoritative.
    pub fn after_rebuild_success(&self) {
        if !self.purgeable {
            return;
        }
        if let Err(e) = ioctl(self.raw_fd(), PURGEABLE_ASHMEM_REBUILD_SUCCESS, std::ptr::null_mut()) {
            warn!(fd = self.raw_fd(), error = %e, "rebuild acknowledgement failed");
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        match &self.ownership {
            Ownership::Owned(fd) => fd.as_raw_fd(),
            Ownership::Adopted(fd) => *fd,
        }
    }

    /// Whether this region unmaps and closes its storage on drop.
    pub fn is_owned(&self) -> bool {
        matches!(self.ownership, Ownership::Owned(_))
    }

    pub fn is_purgeable_supported(&self) -> bool {
        self.purgeable
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn map_len(&self) -> usize {
        self.map_len
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if !self.is_owned() {
            return;
        }
        // SAFETY: mapped in `create` with `map_len`.
        if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.map_len) } {
            error!(error = %e, "munmap of shared region failed");
        }
        if self.purgeable && !self.is_purged() {
            debug!(fd = self.raw_fd(), "shared region released while resident");
        }
        // Descriptor closes with the OwnedFd.
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("ownership", &self.ownership)
            .field("size", &self.size)
            .field("map_len", &self.map_len)
            .field("purgeable", &self.purgeable)
            .finish()
    }
}

fn open_ashmem(len: usize) -> io::Result<OwnedFd> {
    let fd = rustix::fs::open(ASHMEM_DEVICE, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())?;
    let raw = fd.as_raw_fd();

    let mut name = [0u8; ASHMEM_NAME_LEN];
    name[..ASHMEM_NAME.len()].copy_from_slice(ASHMEM_NAME.as_bytes());
    ioctl(raw, ASHMEM_SET_NAME, name.as_mut_ptr().cast())?;
    // SET_SIZE and SET_PROT_MASK take their argument by value.
    ioctl(raw, ASHMEM_SET_SIZE, len as *mut c_void)?;
    ioctl(
        raw,
        ASHMEM_SET_PROT_MASK,
        (libc::PROT_READ | libc::PROT_WRITE) as usize as *mut c_void,
    )?;
    Ok(fd)
}

fn open_memfd(len: usize) -> Result<OwnedFd> {
    let name = CString::new(ASHMEM_NAME).map_err(|_| Error::NoContent)?;
    let fd = rustix::fs::memfd_create(&name, MemfdFlags::CLOEXEC)?;
    rustix::fs::ftruncate(&fd, len as u64)?;
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_encoding() {
        assert_eq!(ASHMEM_GET_PIN_STATUS, 0x7709);
        assert_eq!(PURGEABLE_ASHMEM_REBUILD_SUCCESS, 0x770e);
        assert_eq!(ASHMEM_PIN, 0x4008_7707);
        assert_eq!(ASHMEM_SET_NAME, 0x4100_7701);
    }

    #[test]
    fn test_create_maps_writable_region() {
        let region = SharedRegion::create(100).unwrap();
        assert!(region.is_owned());
        assert!(region.raw_fd() >= 0);
        assert_eq!(region.len(), 100);
        assert_eq!(region.map_len(), PAGE_SIZE);

        unsafe { region.as_mut_ptr().write_bytes(7, 100) };
        let bytes = unsafe { std::slice::from_raw_parts(region.as_mut_ptr(), 100) };
        assert!(bytes.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_pin_controls_without_kernel_support() {
        let region = SharedRegion::create(PAGE_SIZE).unwrap();
        if region.is_purgeable_supported() {
            return;
        }
        assert!(region.pin());
        assert_eq!(region.pin_status(), 0);
        assert!(!region.is_purged());
        assert!(region.unpin());
        region.after_rebuild_success();
    }

    #[test]
    fn test_adopted_region_leaves_storage_alone() {
        let owner = SharedRegion::create(PAGE_SIZE).unwrap();
        unsafe { owner.as_mut_ptr().write(42) };

        let adopted = unsafe { SharedRegion::adopt(PAGE_SIZE, owner.raw_fd(), owner.as_mut_ptr()) }.unwrap();
        assert!(!adopted.is_owned());
        assert_eq!(adopted.raw_fd(), owner.raw_fd());
        drop(adopted);

        // Still mapped and open.
        assert_eq!(unsafe { owner.as_mut_ptr().read() }, 42);
        assert!(rustix::fs::fstat(unsafe { std::os::fd::BorrowedFd::borrow_raw(owner.raw_fd()) }).is_ok());
    }

    #[test]
    fn test_adopted_region_spans_declared_size_only() {
        let owner = SharedRegion::create(PAGE_SIZE).unwrap();
        let adopted = unsafe { SharedRegion::adopt(5, owner.raw_fd(), owner.as_mut_ptr()) }.unwrap();
        assert_eq!(adopted.len(), 5);
        assert_eq!(adopted.map_len(), 5);
    }

    #[test]
    fn test_adopt_rejects_null_and_bad_fd() {
        assert!(unsafe { SharedRegion::adopt(PAGE_SIZE, 3, std::ptr::null_mut()) }.is_err());
        let mut byte = 0u8;
        assert!(unsafe { SharedRegion::adopt(1, -1, &mut byte) }.is_err());
    }
}
