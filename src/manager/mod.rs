//! Resource management across buffers.
//!
//! # Components
//! - [`ResourceManager`] - LRU tracking, eviction pinning and bulk access
//! - [`LruCache`] - recency-ordered registry of buffer handles
//! - [`WorkerPool`] - fixed-size pool running cache and bulk tasks
//! - [`PurgeableResource`] - what the manager may do to a buffer
//! - [`ResourceStats`] - counters

mod lru_cache;
mod resource;
mod resource_manager;
mod stats;
mod worker_pool;

pub use lru_cache::LruCache;
pub use resource::{PurgeableResource, ResourceHandle};
pub use resource_manager::ResourceManager;
pub use stats::{ResourceStats, StatsSnapshot};
pub use worker_pool::WorkerPool;
