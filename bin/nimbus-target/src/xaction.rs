//! Extended actions: long-running, abortable background work
//!
//! At most one xaction of each kind runs at a time. The tracker hands out
//! an [`Xaction`] whose abort token the background loop polls between
//! units of work; `done` fires when the loop has exited.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Finished xactions kept for diagnostics
const HISTORY: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XactKind {
    Rebalance,
    Lru,
}

impl fmt::Display for XactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rebalance => f.write_str("rebalance"),
            Self::Lru => f.write_str("lru"),
        }
    }
}

/// A running extended action
#[derive(Debug)]
pub struct Xaction {
    pub id: u64,
    pub kind: XactKind,
    pub started: SystemTime,
    abort: CancellationToken,
    done: CancellationToken,
}

impl Xaction {
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Resolves once the action has been aborted
    pub async fn aborted(&self) {
        self.abort.cancelled().await;
    }

    /// Resolves once the action has finished
    pub async fn finished(&self) {
        self.done.cancelled().await;
    }
}

/// Diagnostic view of an xaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XactSnapshot {
    pub id: u64,
    pub kind: XactKind,
    pub started: SystemTime,
    pub ended: Option<SystemTime>,
    pub aborted: bool,
}

impl XactSnapshot {
    fn of(xact: &Xaction, ended: Option<SystemTime>) -> Self {
        Self {
            id: xact.id,
            kind: xact.kind,
            started: xact.started,
            ended,
            aborted: xact.is_aborted(),
        }
    }
}

#[derive(Default)]
struct TrackerInner {
    next_id: u64,
    running: HashMap<XactKind, Arc<Xaction>>,
    history: VecDeque<XactSnapshot>,
}

impl TrackerInner {
    fn retire(&mut self, xact: &Xaction) {
        if self.history.len() == HISTORY {
            self.history.pop_front();
        }
        self.history
            .push_back(XactSnapshot::of(xact, Some(SystemTime::now())));
    }
}

/// Registry of running extended actions, keyed by kind
#[derive(Default)]
pub struct XactionTracker {
    inner: Mutex<TrackerInner>,
}

impl XactionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new xaction of `kind`; `None` while one is already running
    pub fn renew(&self, kind: XactKind) -> Option<Arc<Xaction>> {
        let mut inner = self.inner.lock();
        if inner.running.contains_key(&kind) {
            return None;
        }
        inner.next_id += 1;
        let xact = Arc::new(Xaction {
            id: inner.next_id,
            kind,
            started: SystemTime::now(),
            abort: CancellationToken::new(),
            done: CancellationToken::new(),
        });
        inner.running.insert(kind, Arc::clone(&xact));
        info!("Started {kind} xaction {}", xact.id);
        Some(xact)
    }

    #[must_use]
    pub fn find(&self, kind: XactKind) -> Option<Arc<Xaction>> {
        self.inner.lock().running.get(&kind).cloned()
    }

    /// Abort the running xaction of `kind` and stop tracking it
    pub fn abort(&self, kind: XactKind) -> Option<Arc<Xaction>> {
        let mut inner = self.inner.lock();
        let xact = inner.running.remove(&kind)?;
        xact.abort();
        inner.retire(&xact);
        info!("Aborted {kind} xaction {}", xact.id);
        Some(xact)
    }

    /// Mark `xact` as finished
    pub fn finish(&self, xact: &Xaction) {
        {
            let mut inner = self.inner.lock();
            if inner
                .running
                .get(&xact.kind)
                .is_some_and(|running| running.id == xact.id)
            {
                inner.running.remove(&xact.kind);
                inner.retire(xact);
            }
        }
        xact.done.cancel();
        info!("Finished {} xaction {}", xact.kind, xact.id);
    }

    /// Abort everything; true if anything was running
    pub fn abort_all(&self) -> bool {
        let mut inner = self.inner.lock();
        let running: Vec<_> = inner.running.drain().map(|(_, x)| x).collect();
        for xact in &running {
            xact.abort();
            inner.retire(xact);
        }
        !running.is_empty()
    }

    /// Running xactions followed by recently finished ones
    #[must_use]
    pub fn snapshot(&self) -> Vec<XactSnapshot> {
        let inner = self.inner.lock();
        inner
            .running
            .values()
            .map(|x| XactSnapshot::of(x, None))
            .chain(inner.history.iter().cloned())
            .collect()
    }
}
