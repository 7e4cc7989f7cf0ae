//! Nimbus storage target
//!
//! A target caches objects of cloud buckets and stores objects of local
//! buckets on its mount paths. It serves them over a REST API, follows the
//! cluster map and local bucket map pushed by the coordinator, and moves
//! objects to their new owners when targets join.
//!
//! Module map:
//! - [`target`]: shared state and snapshots
//! - [`object`]: GET/PUT/DELETE pipelines
//! - [`listing`]: bucket listings
//! - [`transfer`] and [`rebalance`]: peer transfers
//! - [`maps`]: cluster and local bucket map pushes
//! - [`lru`]: eviction of cached cloud objects
//! - [`xaction`]: background action tracking
//! - [`api`]: HTTP routing

pub mod api;
pub mod error;
pub mod listing;
pub mod lru;
pub mod maps;
pub mod object;
pub mod rebalance;
pub mod registry;
pub mod stats;
pub mod target;
pub mod transfer;
pub mod xaction;

pub use api::router;
pub use maps::MapUpdate;
pub use object::{ObjectRead, PutOutcome};
pub use registry::Registrar;
pub use stats::{StatsSnapshot, TargetStats};
pub use target::{DaemonSnapshot, Target};
pub use xaction::{XactKind, Xaction, XactionTracker};
