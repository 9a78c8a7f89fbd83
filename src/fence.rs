//! Waiting on sync fences.
//!
//! A fence descriptor becomes readable once the work it guards has
//! signalled.

use std::os::fd::{BorrowedFd, RawFd};

use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::Errno;
use tracing::debug;

use crate::common::{Error, Result};

/// Wait up to `timeout_ms` milliseconds (negative waits forever) for `fence`
/// to signal.
pub fn sync_wait(fence: BorrowedFd<'_>, timeout_ms: i32) -> Result<()> {
    let mut fds = [PollFd::new(&fence, PollFlags::IN)];
    loop {
        match poll(&mut fds, timeout_ms) {
            Ok(0) => return Err(Error::FenceTimeout),
            Ok(_) => {
                let revents = fds[0].revents();
                if revents.intersects(PollFlags::ERR | PollFlags::NVAL) {
                    return Err(Error::InvalidFence);
                }
                return Ok(());
            }
            Err(Errno::INTR) | Err(Errno::AGAIN) => {
                debug!("fence poll interrupted, retrying");
            }
            Err(e) => return Err(Error::System(e)),
        }
    }
}

/// [`sync_wait`] on a raw descriptor; negative descriptors are rejected.
///
/// # Safety
/// A non-negative `fd` must be open for the duration of the call.
pub unsafe fn sync_wait_raw(fd: RawFd, timeout_ms: i32) -> Result<()> {
    if fd < 0 {
        return Err(Error::InvalidFence);
    }
    sync_wait(unsafe { BorrowedFd::borrow_raw(fd) }, timeout_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_signalled_fence() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(&[1]).unwrap();
        sync_wait(rx.as_fd(), 1000).unwrap();
    }

    #[test]
    fn test_timeout() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        assert!(matches!(sync_wait(rx.as_fd(), 10), Err(Error::FenceTimeout)));
    }

    #[test]
    fn test_negative_fd() {
        assert!(matches!(
            unsafe { sync_wait_raw(-1, 0) },
            Err(Error::InvalidFence)
        ));
    }
}
