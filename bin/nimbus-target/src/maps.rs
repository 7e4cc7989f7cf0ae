//! Cluster map and local bucket map pushes
//!
//! Both maps only move forward: a push whose version is not newer than the
//! current one is logged and ignored. Accepted maps replace the current
//! snapshot wholesale.

use crate::target::Target;
use nimbus_common::{Error, LocalBucketMap, Result, Smap};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of a map push
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapUpdate {
    /// Version not newer than the current one; nothing changed
    Stale { current: u64 },
    /// Applied; `grew` is set when targets joined the cluster
    Applied { grew: bool },
}

fn remove_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::from_io(e, dir)),
    }
}

impl Target {
    /// Apply a pushed cluster map.
    ///
    /// The map must contain this target.
    pub fn apply_smap(&self, smap: Smap) -> Result<MapUpdate> {
        let _guard = self.map_update.lock();
        let current = self.smap.load_full();
        if smap.version <= current.version {
            if smap.version < current.version {
                warn!(
                    "Ignoring smap v{}: older than current v{}",
                    smap.version, current.version
                );
            }
            return Ok(MapUpdate::Stale {
                current: current.version,
            });
        }
        if !smap.contains(self.id()) {
            return Err(Error::invalid_request(format!(
                "smap v{} does not contain target {}",
                smap.version,
                self.id()
            )));
        }

        let grew = !smap.is_subset_of(&current);
        info!(
            "Smap v{} -> v{}: {} targets",
            current.version,
            smap.version,
            smap.len()
        );
        self.smap.store(Arc::new(smap));
        Ok(MapUpdate::Applied { grew })
    }

    /// Apply a pushed cluster map and rebalance when targets joined
    pub fn apply_smap_and_rebalance(self: &Arc<Self>, smap: Smap) -> Result<MapUpdate> {
        let update = self.apply_smap(smap)?;
        if update == (MapUpdate::Applied { grew: true }) {
            self.start_rebalance();
        }
        Ok(update)
    }

    /// Apply a pushed local bucket map.
    ///
    /// Buckets that disappeared are destroyed on every mount path; every
    /// listed bucket gets its directory. Directory failures are logged and
    /// skipped. Blocking.
    pub fn apply_lbmap(&self, lbmap: LocalBucketMap) -> Result<MapUpdate> {
        let _guard = self.map_update.lock();
        let current = self.lbmap.load_full();
        if lbmap.version <= current.version {
            if lbmap.version < current.version {
                warn!(
                    "Ignoring local bucket map v{}: older than current v{}",
                    lbmap.version, current.version
                );
            }
            return Ok(MapUpdate::Stale {
                current: current.version,
            });
        }

        let grew = lbmap.buckets.difference(&current.buckets).next().is_some();
        info!(
            "Local bucket map v{} -> v{}: {:?}",
            current.version, lbmap.version, lbmap.buckets
        );
        let lbmap = Arc::new(lbmap);
        self.lbmap.store(Arc::clone(&lbmap));

        // The map is already current; a failing directory must not stop the rest
        for bucket in current.removed_in(&lbmap) {
            info!("Destroying local bucket {bucket}");
            for dir in self.mounts.bucket_dirs(bucket, true) {
                if let Err(e) = remove_dir(&dir) {
                    error!("Failed to destroy {}: {e}", dir.display());
                    continue;
                }
                if let Err(e) = self.attrs.remove_tree(&dir) {
                    error!("Failed to drop attributes under {}: {e}", dir.display());
                }
            }
        }
        for bucket in &lbmap.buckets {
            for dir in self.mounts.bucket_dirs(bucket, true) {
                if let Err(e) = std::fs::create_dir_all(&dir) {
                    error!("Failed to create {}: {e}", dir.display());
                }
            }
        }
        Ok(MapUpdate::Applied { grew })
    }
}
