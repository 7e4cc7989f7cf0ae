//! Rebalance xaction
//!
//! After targets join the cluster every object is re-placed by HRW over the
//! new cluster map. Objects now owned by another target are pushed there;
//! the local copy stays as an ordinary cache entry.

use crate::stats::TargetStats;
use crate::target::Target;
use crate::xaction::{XactKind, Xaction};
use nimbus_placement::hrw_target;
use std::sync::Arc;
use tracing::{debug, error, info};

impl Target {
    /// Start a rebalance, superseding one that is still running
    pub fn start_rebalance(self: &Arc<Self>) -> Option<Arc<Xaction>> {
        let stale = self.xactions.abort(XactKind::Rebalance);
        let xact = self.xactions.renew(XactKind::Rebalance)?;

        let target = Arc::clone(self);
        let task = Arc::clone(&xact);
        tokio::spawn(async move {
            if let Some(stale) = stale {
                stale.finished().await;
            }
            target.run_rebalance(&task).await;
            target.xactions.finish(&task);
        });
        Some(xact)
    }

    async fn run_rebalance(&self, xact: &Xaction) {
        let smap = self.smap();
        let mounts = Arc::clone(&self.mounts);
        let walked = tokio::task::spawn_blocking(move || {
            let mut objects = mounts.walk(false, None);
            objects.extend(mounts.walk(true, None));
            objects
        })
        .await;
        let objects = match walked {
            Ok(objects) => objects,
            Err(e) => {
                error!("Rebalance xaction {}: walk failed: {e}", xact.id);
                return;
            }
        };

        info!(
            "Rebalance xaction {}: {} objects, smap v{}",
            xact.id,
            objects.len(),
            smap.version
        );
        let (mut sent, mut skipped, mut failed) = (0u64, 0u64, 0u64);
        for obj in objects {
            if xact.is_aborted() {
                info!("Rebalance xaction {} aborted", xact.id);
                break;
            }
            let Some(owner) = hrw_target(&obj.key.uname(), &smap) else {
                continue;
            };
            if owner.daemon_id == self.id() {
                continue;
            }
            debug!("Rebalance {} -> {}", obj.key, owner.daemon_id);
            match self.send_object(&obj.key, obj.is_local, owner).await {
                Ok(true) => sent += 1,
                Ok(false) => skipped += 1,
                Err(e) => {
                    error!("Rebalance of {} to {} failed: {e}", obj.key, owner.daemon_id);
                    TargetStats::inc(&self.stats().numerr);
                    failed += 1;
                }
            }
        }
        info!(
            "Rebalance xaction {} done: {sent} sent, {skipped} skipped, {failed} failed",
            xact.id
        );
    }
}
