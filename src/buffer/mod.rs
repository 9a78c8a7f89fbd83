//! Purgeable buffers.
//!
//! A buffer owns one backing (anonymous or shared descriptor) and the chain
//! of builders able to regenerate its content after the kernel purged it.
//!
//! # Components
//! - [`PurgeableBuffer`] - the access protocol and rebuild state machine
//! - [`PurgeableBuilder`] / [`BuilderChain`] - content regeneration
//! - [`ReadGuard`] / [`WriteGuard`] - RAII access windows

mod builder;
mod guard;
mod purgeable_buffer;

pub use builder::{BuilderChain, PurgeableBuilder};
pub use guard::{ReadGuard, WriteGuard};
pub use purgeable_buffer::PurgeableBuffer;
