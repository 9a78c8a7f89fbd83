//! Per-process memory counters from `/proc`.
//!
//! Purely observational; nothing in the buffer or manager layers depends on
//! it. All values are in KiB.

use std::fs;
use std::path::Path;

use tracing::error;

use crate::common::{Error, Result};

/// KiB per page in `statm`.
const PAGE_TO_KB: u64 = 4;

/// Resident set size of `pid`, from `/proc/<pid>/statm`.
pub fn rss_kb(pid: u32) -> Result<u64> {
    rss_kb_from(format!("/proc/{pid}/statm"))
}

/// Proportional set size of `pid`, from `/proc/<pid>/smaps_rollup`.
pub fn pss_kb(pid: u32) -> Result<u64> {
    rollup_field_from(format!("/proc/{pid}/smaps_rollup"), "Pss")
}

/// Proportional swap usage of `pid`, from `/proc/<pid>/smaps_rollup`.
pub fn swap_pss_kb(pid: u32) -> Result<u64> {
    rollup_field_from(format!("/proc/{pid}/smaps_rollup"), "SwapPss")
}

pub fn rss_kb_from(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let statm = fs::read_to_string(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "cannot read statm");
        e
    })?;
    parse_statm_rss(&statm)
}

pub fn rollup_field_from(path: impl AsRef<Path>, field: &str) -> Result<u64> {
    let path = path.as_ref();
    let rollup = fs::read_to_string(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "cannot read smaps_rollup");
        e
    })?;
    parse_rollup_field(&rollup, field)
}

/// RSS in KiB from a `statm` line (`size resident shared text lib data dt`,
/// in pages).
pub fn parse_statm_rss(statm: &str) -> Result<u64> {
    let rss = statm
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::MemInfoParse(format!("statm has no resident field: {statm:?}")))?;
    let pages: u64 = rss
        .parse()
        .map_err(|_| Error::MemInfoParse(format!("bad resident page count {rss:?}")))?;
    Ok(pages * PAGE_TO_KB)
}

/// Value of `field` (e.g. `Pss:    1234 kB`) in an `smaps_rollup` dump.
pub fn parse_rollup_field(rollup: &str, field: &str) -> Result<u64> {
    for line in rollup.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim() != field {
            continue;
        }
        let digits = value.split_whitespace().next().unwrap_or("");
        return digits
            .parse()
            .map_err(|_| Error::MemInfoParse(format!("bad {field} value {value:?}")));
    }
    Err(Error::MemInfoParse(format!("{field} not found")))
}
