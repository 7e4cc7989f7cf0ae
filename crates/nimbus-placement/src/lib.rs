//! Nimbus Placement - deterministic object placement
//!
//! Objects are placed with Rendezvous / HRW (Highest Random Weight)
//! hashing: every candidate gets the score `xxh64(key ‖ candidate_id)` and
//! the highest score wins. No shared index or coordination is needed, and
//! adding or removing a candidate only remaps the keys that move to or
//! from it.
//!
//! The same scheme is used at two levels:
//! - across the mount paths of one target (where does the file live)
//! - across the targets of the cluster map (which target owns the key)
//!
//! # Example
//! ```ignore
//! use nimbus_placement::hrw_select;
//!
//! let mpaths = ["/mnt/a", "/mnt/b", "/mnt/c"];
//! let chosen = hrw_select("bucket/object", mpaths.iter(), |m| *m);
//! ```

pub mod hrw;

pub use hrw::{hrw_score, hrw_select, hrw_target};
