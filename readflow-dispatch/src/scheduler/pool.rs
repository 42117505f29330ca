//! Bounded worker pools, one per provider kind.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

/// Outcome of [`WorkerPools::try_dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The work is running.
    Dispatched,
    /// Every worker of the kind is busy; try again later.
    Saturated,
    /// The pools are shut down.
    Closed,
}

/// Occupancy of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub kind: String,
    pub size: usize,
    pub busy: usize,
}

struct Pool {
    size: usize,
    semaphore: Arc<Semaphore>,
}

/// Per-kind concurrency limits over a shared task tracker.
///
/// A slow provider can only exhaust its own pool; the other kinds keep
/// their workers.
pub struct WorkerPools {
    default_size: usize,
    sizes: HashMap<String, usize>,
    pools: DashMap<String, Pool>,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl WorkerPools {
    /// `sizes` overrides `default_size` for specific kinds.
    pub fn new(default_size: usize, sizes: HashMap<String, usize>) -> Self {
        Self {
            default_size: default_size.max(1),
            sizes,
            pools: DashMap::new(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn semaphore(&self, kind: &str) -> Arc<Semaphore> {
        self.pools
            .entry(kind.to_string())
            .or_insert_with(|| {
                let size = self
                    .sizes
                    .get(kind)
                    .copied()
                    .unwrap_or(self.default_size)
                    .max(1);
                debug!(kind = %kind, size, "creating worker pool");
                Pool {
                    size,
                    semaphore: Arc::new(Semaphore::new(size)),
                }
            })
            .semaphore
            .clone()
    }

    /// Run `work` on a worker of `kind` if one is free right now.
    pub fn try_dispatch<F>(&self, kind: &str, work: F) -> DispatchOutcome
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return DispatchOutcome::Closed;
        }

        let permit = match self.semaphore(kind).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                trace!(kind = %kind, "worker pool saturated");
                return DispatchOutcome::Saturated;
            }
            Err(TryAcquireError::Closed) => return DispatchOutcome::Closed,
        };

        self.tracker.spawn(async move {
            let _permit = permit;
            work.await;
        });
        DispatchOutcome::Dispatched
    }

    /// Refuse new work. Running work is unaffected.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for pool in self.pools.iter() {
            pool.semaphore.close();
        }
        self.tracker.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until every dispatched task finished. Only returns once
    /// [`close`](Self::close) was called.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Tasks currently running across all pools.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn snapshot(&self) -> Vec<PoolSnapshot> {
        let mut list: Vec<_> = self
            .pools
            .iter()
            .map(|entry| PoolSnapshot {
                kind: entry.key().clone(),
                size: entry.size,
                busy: entry
                    .size
                    .saturating_sub(entry.semaphore.available_permits()),
            })
            .collect();
        list.sort_by(|a, b| a.kind.cmp(&b.kind));
        list
    }
}
