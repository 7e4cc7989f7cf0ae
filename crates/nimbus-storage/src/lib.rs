//! Nimbus Storage - object files on local mount paths
//!
//! This crate implements the per-target storage primitives:
//! - Mount path discovery and filesystem uniqueness checks
//! - HRW placement of objects onto mount paths and the on-disk layout
//! - Validity attributes (checksum + valid flag) kept next to each file
//! - Staged writes that become visible only through an atomic rename
//! - The name lock manager serializing conflicting access to one object

pub mod attrs;
pub mod mountpath;
pub mod namelock;
pub mod staging;

// Re-exports
pub use attrs::{AttrStore, ObjectAttrs, SidecarStore, XattrStore};
pub use mountpath::{Layout, MountPath, MountSet, WalkedObject};
pub use namelock::{NameLockGuard, NameLockManager, PendingLock, PendingLockInfo};
pub use staging::{StagedFile, receive};
