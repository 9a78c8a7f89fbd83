//! Error types for purgemem.

use thiserror::Error;

/// Convenient Result type alias.
///
/// Instead of writing `Result<T, Error>` everywhere, we can write `Result<T>`.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors that can surface from this crate.
///
/// The buffer access protocol (`begin_read`, `begin_write`, ...) reports
/// failure as `false`; these variants are what gets logged on the way and
/// what the `Result`-returning operations (constructors, resize, page table,
/// meminfo, fence) hand back to the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from `/proc` reads or descriptor operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (mmap, memfd, poll, ...).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// Requested buffer size is zero or not below the hard ceiling.
    #[error("invalid purgeable size {size} (must be in 1..{max})")]
    InvalidSize { size: usize, max: usize },

    /// A page-table operation addressed pages outside the tracked region.
    #[error("range {start:#x}..{end:#x} outside tracked region {region_start:#x}..{region_end:#x}")]
    OutOfRange {
        start: usize,
        end: usize,
        region_start: usize,
        region_end: usize,
    },

    /// The buffer has no backing storage (construction or resize failed).
    #[error("buffer has no backing storage")]
    NoContent,

    /// The builder chain failed on every attempt.
    #[error("rebuild failed after {attempts} attempts")]
    RebuildFailed { attempts: u32 },

    /// LRU capacity outside the accepted range.
    #[error("invalid LRU capacity {capacity} (must be in {min}..={max})")]
    InvalidCapacity {
        capacity: usize,
        min: usize,
        max: usize,
    },

    /// Worker pool size outside the accepted range.
    #[error("invalid worker pool size {size} (must be in {min}..={max})")]
    InvalidPoolSize {
        size: usize,
        min: usize,
        max: usize,
    },

    /// Fence descriptor is negative or reported POLLERR/POLLNVAL.
    #[error("invalid fence descriptor")]
    InvalidFence,

    /// Fence did not signal within the timeout.
    #[error("fence wait timed out")]
    FenceTimeout,

    /// A `/proc` memory counter could not be parsed.
    #[error("cannot parse memory counter: {0}")]
    MemInfoParse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidSize {
            size: 0,
            max: 1024,
        };
        assert_eq!(
            format!("{}", err),
            "invalid purgeable size 0 (must be in 1..1024)"
        );

        let err = Error::RebuildFailed { attempts: 3 };
        assert_eq!(format!("{}", err), "rebuild failed after 3 attempts");
    }

    #[test]
    fn test_out_of_range_display() {
        let err = Error::OutOfRange {
            start: 0x1000,
            end: 0x3000,
            region_start: 0x2000,
            region_end: 0x3000,
        };
        assert!(format!("{}", err).contains("0x1000..0x3000"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();

        match err {
            Error::Io(_) => {}
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_errno_conversion() {
        let err: Error = rustix::io::Errno::NOMEM.into();
        assert!(matches!(err, Error::System(_)));
    }
}
