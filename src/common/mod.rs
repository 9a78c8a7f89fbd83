//! Common types and utilities shared across purgemem.
//!
//! This module contains fundamental primitives used throughout the codebase:
//! - Configuration constants and manager settings
//! - Error types
//! - Buffer identifiers

pub mod config;
pub mod error;
mod buffer_id;

pub use buffer_id::BufferId;
pub use config::ManagerConfig;
pub use error::{Error, Result};
