//! Target state
//!
//! A [`Target`] owns everything one storage daemon needs: the mount set,
//! the attribute store, the name lock table, the cloud backend and the
//! versioned cluster and bucket maps. Maps and configuration are held as
//! atomically swapped snapshots; readers never see a partial update.

use crate::stats::{MountUsage, StatsSnapshot, TargetStats};
use crate::xaction::{XactKind, XactionTracker};
use arc_swap::ArcSwap;
use nimbus_cloud::CloudBackend;
use nimbus_common::{Config, DaemonInfo, Error, LocalBucketMap, ObjectKey, Result, Smap};
use nimbus_storage::{
    AttrStore, MountSet, NameLockGuard, NameLockManager, PendingLockInfo, SidecarStore,
    XattrStore,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A storage target
pub struct Target {
    daemon: DaemonInfo,
    config: ArcSwap<Config>,
    pub(crate) smap: ArcSwap<Smap>,
    pub(crate) lbmap: ArcSwap<LocalBucketMap>,
    pub(crate) mounts: Arc<MountSet>,
    pub(crate) attrs: Arc<dyn AttrStore>,
    pub(crate) locks: Arc<NameLockManager>,
    pub(crate) cloud: Arc<dyn CloudBackend>,
    stats: TargetStats,
    pub(crate) xactions: XactionTracker,
    pub(crate) client: reqwest::Client,
    shutdown: CancellationToken,
    /// Serializes map pushes
    pub(crate) map_update: Mutex<()>,
    config_update: Mutex<()>,
}

/// Reply to `GET /v1/daemon {"what": "smap"}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSnapshot {
    #[serde(flatten)]
    pub daemon: DaemonInfo,
    pub smap_version: u64,
    pub lbmap_version: u64,
}

impl Target {
    /// Bring up a target: resolve mount paths, create the on-disk layout
    /// and pick the attribute store.
    pub fn new(
        config: Config,
        daemon: DaemonInfo,
        cloud: Arc<dyn CloudBackend>,
    ) -> Result<Arc<Self>> {
        let mounts = MountSet::from_config(&config.storage)?;
        mounts.init()?;
        info!(
            "Target {} using {} mount paths",
            daemon.daemon_id,
            mounts.len()
        );

        let attrs: Arc<dyn AttrStore> = if config.storage.no_xattrs {
            info!("Validity attributes kept in sidecar records");
            Arc::new(SidecarStore::new(
                mounts.mpaths().iter().map(|m| m.path().to_path_buf()),
            ))
        } else {
            Arc::new(XattrStore)
        };

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::configuration(format!("http client: {e}")))?;

        Ok(Arc::new(Self {
            daemon,
            config: ArcSwap::from_pointee(config),
            smap: ArcSwap::from_pointee(Smap::default()),
            lbmap: ArcSwap::from_pointee(LocalBucketMap::default()),
            mounts: Arc::new(mounts),
            attrs,
            locks: NameLockManager::new(),
            cloud,
            stats: TargetStats::default(),
            xactions: XactionTracker::new(),
            client,
            shutdown: CancellationToken::new(),
            map_update: Mutex::new(()),
            config_update: Mutex::new(()),
        }))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.daemon.daemon_id
    }

    #[must_use]
    pub const fn daemon(&self) -> &DaemonInfo {
        &self.daemon
    }

    /// Current configuration snapshot
    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Current cluster map
    #[must_use]
    pub fn smap(&self) -> Arc<Smap> {
        self.smap.load_full()
    }

    /// Current local bucket map
    #[must_use]
    pub fn lbmap(&self) -> Arc<LocalBucketMap> {
        self.lbmap.load_full()
    }

    #[must_use]
    pub fn mounts(&self) -> &MountSet {
        &self.mounts
    }

    #[must_use]
    pub const fn stats(&self) -> &TargetStats {
        &self.stats
    }

    #[must_use]
    pub const fn xactions(&self) -> &XactionTracker {
        &self.xactions
    }

    #[must_use]
    pub const fn locks(&self) -> &Arc<NameLockManager> {
        &self.locks
    }

    /// Token cancelled when the target is asked to shut down
    #[must_use]
    pub const fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    #[must_use]
    pub fn daemon_snapshot(&self) -> DaemonSnapshot {
        DaemonSnapshot {
            daemon: self.daemon.clone(),
            smap_version: self.smap.load().version,
            lbmap_version: self.lbmap.load().version,
        }
    }

    /// Whether `bucket` is a local bucket
    #[must_use]
    pub fn is_local(&self, bucket: &str) -> bool {
        self.lbmap.load().contains(bucket)
    }

    /// File name of `key` and whether it lives in the local namespace
    #[must_use]
    pub fn fqn(&self, key: &ObjectKey) -> (PathBuf, bool) {
        let is_local = self.is_local(key.bucket());
        (self.mounts.fqn(key, is_local), is_local)
    }

    /// Acquire the name lock of `key` with the configured timeout
    pub(crate) async fn lock_name(
        &self,
        key: &ObjectKey,
        exclusive: bool,
        fqn: &Path,
    ) -> Result<NameLockGuard> {
        let timeout = self.config.load().lock.timeout();
        self.locks
            .lock(
                &key.uname(),
                exclusive,
                PendingLockInfo::new(fqn.to_path_buf()),
                timeout,
            )
            .await
    }

    /// Apply a runtime configuration change.
    ///
    /// Disabling LRU aborts a running sweep.
    pub fn update_config(&self, name: &str, value: &str) -> Result<()> {
        let _guard = self.config_update.lock();
        let mut config = Config::clone(&self.config.load());
        config.set(name, value)?;
        let lru_enabled = config.lru.enabled;
        self.config.store(Arc::new(config));
        info!("Config {name} set to {value:?}");

        if !lru_enabled && self.xactions.abort(XactKind::Lru).is_some() {
            info!("LRU disabled, aborted running sweep");
        }
        Ok(())
    }

    /// Live counters with per mount path usage
    pub async fn stats_snapshot(&self) -> Result<StatsSnapshot> {
        let mut snapshot = self.stats.snapshot();
        let mounts = Arc::clone(&self.mounts);
        snapshot.mountpaths = tokio::task::spawn_blocking(move || {
            let mut usage: Vec<MountUsage> = mounts
                .mpaths()
                .iter()
                .map(|m| MountUsage {
                    path: m.path().to_path_buf(),
                    ..MountUsage::default()
                })
                .collect();
            for is_local in [true, false] {
                for obj in mounts.walk(is_local, None) {
                    if let Some(u) = usage.iter_mut().find(|u| obj.fqn.starts_with(&u.path)) {
                        u.used += obj.size;
                        u.files += 1;
                    }
                }
            }
            usage
        })
        .await
        .map_err(|e| Error::internal(format!("usage walk: {e}")))?;
        snapshot.xactions = self.xactions.snapshot();
        snapshot.locks_held = self.locks.pending().len() as u64;
        Ok(snapshot)
    }

    /// Stop background work and release blocked requests.
    ///
    /// Returns true when an extended action was running.
    pub fn stop(&self) -> bool {
        let was_running = self.xactions.abort_all();
        self.locks.abort();
        self.shutdown.cancel();
        info!(
            "Target {} stopping (xactions running: {was_running})",
            self.daemon.daemon_id
        );
        was_running
    }
}
