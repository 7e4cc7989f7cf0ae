//! Target statistics

use crate::xaction::XactSnapshot;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live operation counters of a target
#[derive(Debug, Default)]
pub struct TargetStats {
    pub numget: AtomicU64,
    pub numcoldget: AtomicU64,
    pub numput: AtomicU64,
    pub numdelete: AtomicU64,
    pub numlist: AtomicU64,
    pub numsendfile: AtomicU64,
    pub numrecvfile: AtomicU64,
    pub numerr: AtomicU64,
    pub numlru_evicted: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl TargetStats {
    /// Bump a counter by one
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump a counter by `n`
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            numget: load(&self.numget),
            numcoldget: load(&self.numcoldget),
            numput: load(&self.numput),
            numdelete: load(&self.numdelete),
            numlist: load(&self.numlist),
            numsendfile: load(&self.numsendfile),
            numrecvfile: load(&self.numrecvfile),
            numerr: load(&self.numerr),
            numlru_evicted: load(&self.numlru_evicted),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            mountpaths: Vec::new(),
            xactions: Vec::new(),
            locks_held: 0,
        }
    }
}

/// Serialized form of [`TargetStats`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub numget: u64,
    pub numcoldget: u64,
    pub numput: u64,
    pub numdelete: u64,
    pub numlist: u64,
    pub numsendfile: u64,
    pub numrecvfile: u64,
    pub numerr: u64,
    pub numlru_evicted: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Usage of each mount path
    #[serde(default)]
    pub mountpaths: Vec<MountUsage>,
    /// Running and recently finished xactions
    #[serde(default)]
    pub xactions: Vec<XactSnapshot>,
    #[serde(default)]
    pub locks_held: u64,
}

/// Bytes and files stored on one mount path
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountUsage {
    pub path: PathBuf,
    pub used: u64,
    pub files: u64,
}
