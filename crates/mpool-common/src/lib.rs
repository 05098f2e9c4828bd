//! Mpool Common - Shared types and utilities
//!
//! This crate provides the common types, error definitions, and
//! configuration structures used across the mpool crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{DriveConfig, MpoolConfig, ReadAheadConfig};
pub use error::{Error, Result};
pub use types::*;
