//! Storage layer - mappings, descriptors and the page table.
//!
//! - [`UxPageTable`] - per-page pin counts and presence
//! - [`AnonRegion`] - anonymous mapping tracked by a page table
//! - [`SharedRegion`] - shared memory descriptor with device-level pinning
//! - [`Backing`] - the variant a buffer actually holds

mod anon;
mod backing;
pub mod page_table;
mod shared_fd;

pub use anon::AnonRegion;
pub use backing::{Backing, BackingKind};
pub use page_table::{PageTableMode, UxPageTable, UxpteState};
pub use shared_fd::SharedRegion;
