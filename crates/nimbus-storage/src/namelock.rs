//! Per-object name locks
//!
//! Readers share a name, writers hold it exclusively. A waiting writer
//! blocks new readers so a steady stream of GETs cannot starve a PUT.
//! Waiters give up after a timeout or when the manager is aborted at
//! shutdown. Locks are released when their [`NameLockGuard`] is dropped.

use nimbus_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Diagnostic record attached to each granted lock
#[derive(Clone, Debug)]
pub struct PendingLockInfo {
    pub since: SystemTime,
    pub fqn: PathBuf,
}

impl PendingLockInfo {
    #[must_use]
    pub fn new(fqn: PathBuf) -> Self {
        Self {
            since: SystemTime::now(),
            fqn,
        }
    }
}

/// Snapshot of one held lock
#[derive(Clone, Debug)]
pub struct PendingLock {
    pub key: String,
    pub exclusive: bool,
    pub info: PendingLockInfo,
}

#[derive(Default)]
struct LockEntry {
    exclusive: bool,
    shared: usize,
    waiters: usize,
    exclusive_waiters: usize,
    holders: HashMap<u64, (bool, PendingLockInfo)>,
    notify: Arc<Notify>,
}

impl LockEntry {
    const fn can_grant(&self, exclusive: bool) -> bool {
        if exclusive {
            !self.exclusive && self.shared == 0
        } else {
            !self.exclusive && self.exclusive_waiters == 0
        }
    }

    const fn is_idle(&self) -> bool {
        !self.exclusive && self.shared == 0 && self.waiters == 0
    }

    const fn add_waiter(&mut self, exclusive: bool) {
        self.waiters += 1;
        if exclusive {
            self.exclusive_waiters += 1;
        }
    }

    const fn remove_waiter(&mut self, exclusive: bool) {
        self.waiters -= 1;
        if exclusive {
            self.exclusive_waiters -= 1;
        }
    }
}

/// Lock table keyed by object name (`bucket/object`)
pub struct NameLockManager {
    table: Mutex<HashMap<String, LockEntry>>,
    next_id: AtomicU64,
    abort: CancellationToken,
}

impl NameLockManager {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            abort: CancellationToken::new(),
        })
    }

    /// Acquire `key` in shared or exclusive mode.
    ///
    /// Fails with [`Error::LockTimeout`] when a conflicting holder does
    /// not release within `timeout`, and with [`Error::Aborted`] once the
    /// manager has been aborted.
    pub async fn lock(
        self: &Arc<Self>,
        key: &str,
        exclusive: bool,
        info: PendingLockInfo,
        timeout: Duration,
    ) -> Result<NameLockGuard> {
        let deadline = Instant::now() + timeout;
        let mut waiting = false;

        loop {
            let notify: Arc<Notify>;
            let notified;
            {
                let mut table = self.table.lock();
                let entry = table.entry(key.to_string()).or_default();
                if waiting {
                    entry.remove_waiter(exclusive);
                }
                if self.abort.is_cancelled() {
                    if entry.is_idle() {
                        table.remove(key);
                    }
                    return Err(Error::Aborted);
                }
                if entry.can_grant(exclusive) {
                    let holder = self.grant(entry, exclusive, info);
                    trace!("lock {key} exclusive={exclusive} holder={holder}");
                    return Ok(NameLockGuard {
                        manager: Arc::clone(self),
                        key: key.to_string(),
                        holder,
                        exclusive,
                    });
                }

                entry.add_waiter(exclusive);
                waiting = true;
                notify = Arc::clone(&entry.notify);
                // Registered under the table lock so a release between
                // here and the select below is not missed
                notified = notify.notified();
            }

            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    self.give_up(key, exclusive);
                    return Err(Error::LockTimeout { key: key.to_string() });
                }
                () = self.abort.cancelled() => {
                    self.give_up(key, exclusive);
                    return Err(Error::Aborted);
                }
            }
        }
    }

    /// Acquire `key` only if it is free right now
    pub fn try_lock(
        self: &Arc<Self>,
        key: &str,
        exclusive: bool,
        info: PendingLockInfo,
    ) -> Option<NameLockGuard> {
        if self.abort.is_cancelled() {
            return None;
        }
        let mut table = self.table.lock();
        let entry = table.entry(key.to_string()).or_default();
        if !entry.can_grant(exclusive) {
            return None;
        }
        let holder = self.grant(entry, exclusive, info);
        Some(NameLockGuard {
            manager: Arc::clone(self),
            key: key.to_string(),
            holder,
            exclusive,
        })
    }

    /// Fail every current and future waiter with [`Error::Aborted`]
    pub fn abort(&self) {
        self.abort.cancel();
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Currently held locks
    #[must_use]
    pub fn pending(&self) -> Vec<PendingLock> {
        let table = self.table.lock();
        let mut out: Vec<PendingLock> = table
            .iter()
            .flat_map(|(key, entry)| {
                entry.holders.values().map(|(exclusive, info)| PendingLock {
                    key: key.clone(),
                    exclusive: *exclusive,
                    info: info.clone(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.info.since.cmp(&b.info.since));
        out
    }

    fn grant(&self, entry: &mut LockEntry, exclusive: bool, info: PendingLockInfo) -> u64 {
        let holder = self.next_id.fetch_add(1, Ordering::Relaxed);
        if exclusive {
            entry.exclusive = true;
        } else {
            entry.shared += 1;
        }
        entry.holders.insert(holder, (exclusive, info));
        holder
    }

    fn give_up(&self, key: &str, exclusive: bool) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(key) {
            entry.remove_waiter(exclusive);
            if entry.is_idle() {
                table.remove(key);
            } else if exclusive {
                // Readers held back by this writer may proceed
                entry.notify.notify_waiters();
            }
        }
    }

    fn unlock(&self, key: &str, holder: u64, exclusive: bool) {
        let mut table = self.table.lock();
        let Some(entry) = table.get_mut(key) else {
            warn!("unlock of {key} which is not locked");
            return;
        };
        entry.holders.remove(&holder);
        if exclusive {
            entry.exclusive = false;
        } else {
            entry.shared = entry.shared.saturating_sub(1);
        }
        trace!("unlock {key} exclusive={exclusive} holder={holder}");

        if entry.is_idle() {
            table.remove(key);
        } else {
            entry.notify.notify_waiters();
        }
    }

    fn downgrade(&self, key: &str, holder: u64) {
        let mut table = self.table.lock();
        let Some(entry) = table.get_mut(key) else {
            warn!("downgrade of {key} which is not locked");
            return;
        };
        entry.exclusive = false;
        entry.shared += 1;
        if let Some((exclusive, _)) = entry.holders.get_mut(&holder) {
            *exclusive = false;
        }
        entry.notify.notify_waiters();
    }
}

/// A held name lock; released on drop
pub struct NameLockGuard {
    manager: Arc<NameLockManager>,
    key: String,
    holder: u64,
    exclusive: bool,
}

impl NameLockGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub const fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Turn an exclusive hold into a shared one without releasing it.
    /// No-op for shared holds.
    pub fn downgrade(&mut self) {
        if self.exclusive {
            self.manager.downgrade(&self.key, self.holder);
            self.exclusive = false;
        }
    }

    /// Release explicitly
    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for NameLockGuard {
    fn drop(&mut self) {
        self.manager.unlock(&self.key, self.holder, self.exclusive);
    }
}

impl std::fmt::Debug for NameLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameLockGuard")
            .field("key", &self.key)
            .field("exclusive", &self.exclusive)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    const LONG: Duration = Duration::from_secs(5);

    fn info() -> PendingLockInfo {
        PendingLockInfo::new(PathBuf::from("/m/cloud/b/o"))
    }

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let locks = NameLockManager::new();
        let a = locks.lock("b/o", false, info(), LONG).await.unwrap();
        let b = locks.lock("b/o", false, info(), LONG).await.unwrap();
        assert_eq!(locks.pending().len(), 2);
        drop(a);
        drop(b);
        assert!(locks.pending().is_empty());
        assert!(locks.table.lock().is_empty());
    }

    #[tokio::test]
    async fn test_exclusive_times_out() {
        let locks = NameLockManager::new();
        let _held = locks.lock("b/o", true, info(), LONG).await.unwrap();

        let err = locks
            .lock("b/o", false, info(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));

        // Other names are independent
        locks.lock("b/other", true, info(), LONG).await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_waits_for_reader() {
        let locks = NameLockManager::new();
        let reader = locks.lock("b/o", false, info(), LONG).await.unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let task = {
            let locks = Arc::clone(&locks);
            let acquired = Arc::clone(&acquired);
            tokio::spawn(async move {
                let _w = locks.lock("b/o", true, info(), LONG).await.unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!acquired.load(Ordering::SeqCst));

        // A waiting writer holds back new readers
        assert!(locks.try_lock("b/o", false, info()).is_none());

        drop(reader);
        task.await.unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_downgrade_admits_readers() {
        let locks = NameLockManager::new();
        let mut writer = locks.lock("b/o", true, info(), LONG).await.unwrap();

        let reader = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.lock("b/o", false, info(), LONG).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        writer.downgrade();
        assert!(!writer.is_exclusive());
        let reader = reader.await.unwrap().unwrap();

        // Writers still excluded while either reader holds the name
        assert!(locks.try_lock("b/o", true, info()).is_none());
        drop(writer);
        assert!(locks.try_lock("b/o", true, info()).is_none());
        drop(reader);
        assert!(locks.try_lock("b/o", true, info()).is_some());
    }

    #[tokio::test]
    async fn test_abort_wakes_waiters() {
        let locks = NameLockManager::new();
        let _held = locks.lock("b/o", true, info(), LONG).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.lock("b/o", true, info(), LONG).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.abort();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Aborted));
        assert!(matches!(
            locks.lock("b/x", false, info(), LONG).await,
            Err(Error::Aborted)
        ));
        assert!(locks.try_lock("b/y", false, info()).is_none());
    }

    #[tokio::test]
    async fn test_exclusive_holders_serialize() {
        let locks = NameLockManager::new();
        let inside = Arc::new(AtomicU64::new(0));
        let mut tasks = Vec::new();

        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            tasks.push(tokio::spawn(async move {
                let _g = locks.lock("b/o", true, info(), LONG).await.unwrap();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(locks.table.lock().is_empty());
    }
}
