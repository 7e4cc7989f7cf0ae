//! LRU eviction of cached cloud objects
//!
//! The sweep walks the cloud namespace, and while the cached bytes exceed
//! `lru.capacity_bytes` removes files in access-time order. Busy objects
//! are skipped. Local buckets are never evicted.

use crate::stats::TargetStats;
use crate::target::Target;
use crate::xaction::{XactKind, Xaction};
use nimbus_storage::PendingLockInfo;
use std::io;
use std::sync::Arc;
use tracing::{debug, error, info};

impl Target {
    /// Start an LRU sweep; `None` when one is already running
    pub fn start_lru(self: &Arc<Self>) -> Option<Arc<Xaction>> {
        let xact = self.xactions.renew(XactKind::Lru)?;
        let target = Arc::clone(self);
        let task = Arc::clone(&xact);
        tokio::spawn(async move {
            target.run_lru(&task).await;
            target.xactions.finish(&task);
        });
        Some(xact)
    }

    /// Kick off a sweep after a cold GET grew the cache
    pub(crate) fn lru_after_cold_get(self: &Arc<Self>) {
        let config = self.config();
        if config.lru.enabled && config.lru.capacity_bytes > 0 {
            self.start_lru();
        }
    }

    async fn run_lru(&self, xact: &Xaction) {
        let capacity = self.config().lru.capacity_bytes;
        if capacity == 0 {
            debug!("LRU xaction {}: no capacity limit", xact.id);
            return;
        }

        let mounts = Arc::clone(&self.mounts);
        let mut objects = match tokio::task::spawn_blocking(move || mounts.walk(false, None)).await {
            Ok(objects) => objects,
            Err(e) => {
                error!("LRU xaction {}: walk failed: {e}", xact.id);
                return;
            }
        };
        let mut used: u64 = objects.iter().map(|o| o.size).sum();
        if used <= capacity {
            debug!("LRU xaction {}: {used} of {capacity} bytes used", xact.id);
            return;
        }
        objects.sort_by_key(|o| o.atime);

        let mut evicted = 0u64;
        for obj in objects {
            if used <= capacity {
                break;
            }
            if xact.is_aborted() {
                info!("LRU xaction {} aborted", xact.id);
                break;
            }
            let Some(_guard) =
                self.locks
                    .try_lock(&obj.key.uname(), true, PendingLockInfo::new(obj.fqn.clone()))
            else {
                debug!("LRU: {} busy, skipped", obj.key);
                continue;
            };

            match tokio::fs::remove_file(&obj.fqn).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    error!("LRU: failed to evict {}: {e}", obj.fqn.display());
                    TargetStats::inc(&self.stats().numerr);
                    continue;
                }
            }
            if let Err(e) = self.attrs.remove(&obj.fqn) {
                error!("LRU: failed to drop attributes of {}: {e}", obj.key);
            }
            used = used.saturating_sub(obj.size);
            evicted += 1;
            TargetStats::inc(&self.stats().numlru_evicted);
            debug!("LRU evicted {}", obj.key);
        }
        info!(
            "LRU xaction {}: evicted {evicted} objects, {used} of {capacity} bytes used",
            xact.id
        );
    }
}
