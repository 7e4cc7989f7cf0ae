//! Nimbus Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, content checksums, the target
//! configuration, and the JSON control structures exchanged with the
//! coordinator and with peer targets.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Checksum, ChecksumCalculator, CONTENT_HASH_HEADER};
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
