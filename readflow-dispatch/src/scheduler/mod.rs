//! Background job scheduler.
//!
//! Runs recurring jobs (retry sweep, cleanup) on independent timers and
//! owns the per-kind [`WorkerPools`] the jobs dispatch into. Shutdown is
//! bounded: ticks stop first, in-flight work gets a grace window, and
//! whatever is still running afterwards is told to cancel.

mod pool;
mod retry;

pub use pool::{DispatchOutcome, PoolSnapshot, WorkerPools};
pub use retry::{MAX_DELAY_MS, RetryPolicy};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::Result;

/// Time given to cancelled work to write its state back.
const CANCEL_GRACE: Duration = Duration::from_millis(100);

/// A unit of recurring background work.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// Run one tick. `cancel` fires when shutdown gives up waiting.
    async fn run(&self, cancel: &CancellationToken) -> Result<()>;
}

struct ScheduledJob {
    job: Arc<dyn Job>,
    interval: Duration,
}

/// Report from [`JobScheduler::shutdown`].
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Work running when shutdown began.
    pub in_flight: usize,
    /// Work still running when the grace window closed.
    pub abandoned: usize,
    /// Wall time spent in shutdown.
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Check if all work finished inside the timeout.
    pub fn is_graceful(&self) -> bool {
        self.abandoned == 0
    }
}

/// Periodic and background task runner.
pub struct JobScheduler {
    jobs: Mutex<Vec<ScheduledJob>>,
    pools: Arc<WorkerPools>,
    /// Stops timers and listeners.
    tick_token: CancellationToken,
    /// Cooperative cancellation for in-flight work.
    work_token: CancellationToken,
    loops: TaskTracker,
    started: AtomicBool,
    shutting_down: AtomicBool,
}

impl JobScheduler {
    pub fn new(pools: Arc<WorkerPools>) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            pools,
            tick_token: CancellationToken::new(),
            work_token: CancellationToken::new(),
            loops: TaskTracker::new(),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Scheduler with pools of `default_size` workers per kind.
    pub fn with_pool_sizes(default_size: usize, sizes: HashMap<String, usize>) -> Self {
        Self::new(Arc::new(WorkerPools::new(default_size, sizes)))
    }

    pub fn pools(&self) -> Arc<WorkerPools> {
        self.pools.clone()
    }

    /// Token cancelled when shutdown stops waiting for in-flight work.
    pub fn work_token(&self) -> CancellationToken {
        self.work_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Run `job` every `interval`. Jobs added after [`start`](Self::start)
    /// begin ticking immediately.
    pub fn every(&self, job: Arc<dyn Job>, interval: Duration) {
        if self.started.load(Ordering::SeqCst) {
            self.spawn_job(job, interval);
        } else {
            self.jobs.lock().push(ScheduledJob { job, interval });
        }
    }

    /// Run a long-lived listener until shutdown begins.
    ///
    /// The future is dropped when the scheduler stops ticking.
    pub fn spawn_listener<F, Fut>(&self, name: &str, listener: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = self.tick_token.clone();
        let fut = listener(stop.clone());
        let name = name.to_string();
        self.loops.spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = fut => {}
            }
            debug!(listener = %name, "listener stopped");
        });
    }

    /// Begin ticking every registered job.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let jobs = std::mem::take(&mut *self.jobs.lock());
        info!(jobs = jobs.len(), "Starting job scheduler");
        for ScheduledJob { job, interval } in jobs {
            self.spawn_job(job, interval);
        }
    }

    fn spawn_job(&self, job: Arc<dyn Job>, interval: Duration) {
        if self.tick_token.is_cancelled() {
            return;
        }
        let stop = self.tick_token.clone();
        let work = self.work_token.clone();

        self.loops.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(job = %job.name(), ?interval, "job scheduled");

            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    result = job.run(&work) => {
                        if let Err(e) = result {
                            warn!(job = %job.name(), error = %e, "job failed");
                        }
                    }
                }
            }
            debug!(job = %job.name(), "job stopped");
        });
    }

    /// Stop ticking and dispatching, wait up to `timeout` for in-flight
    /// work, then cancel whatever is left.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        let deadline = started + timeout;
        self.shutting_down.store(true, Ordering::SeqCst);

        // Phase 1: no new ticks, no new dispatches.
        self.tick_token.cancel();
        self.pools.close();
        self.loops.close();

        let in_flight = self.pools.in_flight();
        info!(in_flight, ?timeout, "Shutting down job scheduler");

        // Phase 2: wait for in-flight work.
        let drained = tokio::select! {
            _ = async {
                self.loops.wait().await;
                self.pools.wait().await;
            } => true,
            _ = tokio::time::sleep_until(deadline) => false,
        };

        // Phase 3: cancel stragglers and give them a moment to write back.
        let mut abandoned = 0;
        if !drained {
            let remaining = self.pools.in_flight();
            warn!(remaining, "Shutdown timeout reached, cancelling in-flight work");
            self.work_token.cancel();
            let _ = tokio::time::timeout(CANCEL_GRACE, self.pools.wait()).await;
            abandoned = self.pools.in_flight();
            if abandoned > 0 {
                warn!(abandoned, "In-flight work abandoned at shutdown");
            }
        }

        let report = ShutdownReport {
            in_flight,
            abandoned,
            elapsed: started.elapsed(),
        };
        info!(
            in_flight = report.in_flight,
            abandoned = report.abandoned,
            elapsed = ?report.elapsed,
            "Job scheduler stopped"
        );
        report
    }
}
