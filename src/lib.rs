//! purgemem - Purgeable memory buffers with rebuildable content.
//!
//! A purgeable buffer holds content the kernel may drop under memory
//! pressure. Access goes through read/write windows; a window pins the
//! backing, and if the content was purged the buffer's builder chain
//! regenerates it before the window opens.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            purgemem                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │            Resource Manager (manager/)                   │   │
//! │  │     LruCache + WorkerPool + bulk begin/end access        │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓  PurgeableResource               │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │            Buffers (buffer/)                             │   │
//! │  │   PurgeableBuffer state machine + BuilderChain + guards  │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓  pin / unpin / is_purged         │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │            Storage (storage/)                            │   │
//! │  │   AnonRegion + UxPageTable  |  SharedRegion (ashmem)     │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Shared primitives (BufferId, Error, config)
//! - [`storage`] - Mappings, descriptors and the page table
//! - [`buffer`] - Purgeable buffers, builders and access guards
//! - [`manager`] - LRU resource manager
//! - [`meminfo`] - Process memory counters
//! - [`fence`] - Sync fence waits
//!
//! # Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use purgemem::{ManagerConfig, PurgeableBuffer, ResourceManager};
//!
//! let manager = ResourceManager::new(ManagerConfig::default());
//! let buffer = Arc::new(PurgeableBuffer::new(
//!     4096,
//!     Box::new(|data: &mut [u8]| {
//!         data.fill(0xAB);
//!         true
//!     }),
//! ));
//! manager.add_resource(buffer.clone());
//!
//! if let Some(content) = buffer.read() {
//!     assert_eq!(content[0], 0xAB);
//! }
//! manager.remove_resource(buffer);
//! ```

pub mod buffer;
pub mod common;
pub mod fence;
pub mod manager;
pub mod meminfo;
pub mod storage;

pub use common::config::{MAX_PURGEABLE_SIZE, PAGE_SIZE};
pub use common::{BufferId, Error, ManagerConfig, Result};

pub use buffer::{BuilderChain, PurgeableBuffer, PurgeableBuilder, ReadGuard, WriteGuard};
pub use manager::{PurgeableResource, ResourceHandle, ResourceManager, ResourceStats, StatsSnapshot};
pub use storage::{BackingKind, PageTableMode};
