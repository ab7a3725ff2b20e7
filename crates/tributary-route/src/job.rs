//! Scheduled jobs: the periodic routing run and staging purge.
//!
//! Each job runs on its own tokio task at a fixed period until the shutdown
//! signal flips to `true`. Cluster-wide exclusion comes from the lock table,
//! not from the scheduler.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tributary_stage::StagingManager;

use crate::cluster_lock::{ClusterLockService, COMMON_LOCK_ID, PURGE, ROUTE};
use crate::current_time_ms;
use crate::error::RouteResult;
use crate::router::RouterService;

/// A unit of periodic work.
pub trait ScheduledJob: Send + Sync {
    /// Lock action naming the job.
    fn action(&self) -> &str;

    /// Run once; returns the number of items processed.
    fn run(&self) -> impl Future<Output = RouteResult<usize>> + Send;
}

/// Periodic routing run. The router takes the route lock itself.
#[derive(Debug)]
pub struct RouteJob {
    router: Arc<RouterService>,
}

impl RouteJob {
    /// Job driving `router`.
    pub fn new(router: Arc<RouterService>) -> Self {
        Self { router }
    }
}

impl ScheduledJob for RouteJob {
    fn action(&self) -> &str {
        ROUTE
    }

    fn run(&self) -> impl Future<Output = RouteResult<usize>> + Send {
        self.router.route_data(false)
    }
}

/// Periodic purge of consumed staged resources and abandoned writes.
#[derive(Debug)]
pub struct PurgeJob {
    staging: Arc<StagingManager>,
}

impl PurgeJob {
    /// Job purging `staging`.
    pub fn new(staging: Arc<StagingManager>) -> Self {
        Self { staging }
    }
}

impl ScheduledJob for PurgeJob {
    fn action(&self) -> &str {
        PURGE
    }

    fn run(&self) -> impl Future<Output = RouteResult<usize>> + Send {
        let staging = Arc::clone(&self.staging);
        async move { Ok(staging.purge(current_time_ms())?) }
    }
}

/// Runs the wrapped job only while holding its cluster lock.
#[derive(Debug)]
pub struct LockedJob<J> {
    inner: J,
    locks: Arc<ClusterLockService>,
}

impl<J: ScheduledJob> LockedJob<J> {
    /// Gate `inner` on the lock named by its action.
    pub fn new(inner: J, locks: Arc<ClusterLockService>) -> Self {
        Self { inner, locks }
    }
}

impl<J: ScheduledJob> ScheduledJob for LockedJob<J> {
    fn action(&self) -> &str {
        self.inner.action()
    }

    fn run(&self) -> impl Future<Output = RouteResult<usize>> + Send {
        async move {
            let action = self.inner.action();
            let Some(_guard) = self.locks.guard(action, COMMON_LOCK_ID)? else {
                if self.locks.is_infinite_locked(action, COMMON_LOCK_ID)? {
                    info!(action, "action is stopped, skipping job");
                } else {
                    debug!(action, "lock held elsewhere, skipping job");
                }
                return Ok(0);
            };
            self.inner.run().await
        }
    }
}

/// Spawns scheduled jobs.
#[derive(Debug)]
pub struct JobRunner;

impl JobRunner {
    /// Run `job` every `period` until `shutdown` turns `true` or its sender
    /// is dropped. A failed run is logged and the schedule continues.
    pub fn spawn<J>(job: Arc<J>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()>
    where
        J: ScheduledJob + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(action = job.action(), period_ms = period.as_millis() as u64, "job scheduled");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match job.run().await {
                            Ok(processed) => debug!(action = job.action(), processed, "job run finished"),
                            Err(e) if e.is_transient() => warn!(action = job.action(), error = %e, "job run failed"),
                            Err(e) => error!(action = job.action(), error = %e, "job run failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(action = job.action(), "job stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: AtomicUsize,
    }

    impl ScheduledJob for CountingJob {
        fn action(&self) -> &str {
            PURGE
        }

        fn run(&self) -> impl Future<Output = RouteResult<usize>> + Send {
            let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(runs) }
        }
    }

    #[tokio::test]
    async fn test_runner_stops_on_shutdown() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
        });
        let (tx, rx) = watch::channel(false);
        let handle = JobRunner::spawn(Arc::clone(&job), Duration::from_millis(5), rx);
        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        let runs = job.runs.load(Ordering::SeqCst);
        assert!(runs >= 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), runs);
    }

    #[tokio::test]
    async fn test_runner_stops_when_sender_dropped() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
        });
        let (tx, rx) = watch::channel(false);
        let handle = JobRunner::spawn(job, Duration::from_secs(3600), rx);
        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_locked_job_skips_when_contended() {
        let db = Database::open_in_memory().unwrap();
        let locks = Arc::new(ClusterLockService::new(db.clone(), "server-a", 60_000, 30_000));
        locks.init().unwrap();
        let other = ClusterLockService::new(db, "server-b", 60_000, 30_000);
        assert!(other.try_acquire(PURGE, COMMON_LOCK_ID).unwrap());

        let job = LockedJob::new(
            CountingJob {
                runs: AtomicUsize::new(0),
            },
            Arc::clone(&locks),
        );
        assert_eq!(job.run().await.unwrap(), 0);
        assert_eq!(job.inner.runs.load(Ordering::SeqCst), 0);

        assert!(other.release(PURGE, COMMON_LOCK_ID).unwrap());
        assert_eq!(job.run().await.unwrap(), 1);
        // The guard released the lock after the run.
        assert!(other.try_acquire(PURGE, COMMON_LOCK_ID).unwrap());
    }

    #[tokio::test]
    async fn test_locked_job_skips_stopped_action() {
        let db = Database::open_in_memory().unwrap();
        let locks = Arc::new(ClusterLockService::new(db, "server-a", -1, 30_000));
        locks.init().unwrap();
        assert!(locks.acquire_infinite(PURGE, COMMON_LOCK_ID).unwrap());

        let job = LockedJob::new(
            CountingJob {
                runs: AtomicUsize::new(0),
            },
            Arc::clone(&locks),
        );
        assert_eq!(job.run().await.unwrap(), 0);
        assert_eq!(job.inner.runs.load(Ordering::SeqCst), 0);

        assert!(locks.clear_infinite(PURGE, COMMON_LOCK_ID).unwrap());
        assert_eq!(job.run().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_job_removes_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let staging = Arc::new(StagingManager::new(dir.path(), 1024, 3_600_000).unwrap());
        let mut writer = staging.create("outgoing/001/1").unwrap();
        std::io::Write::write_all(&mut writer, b"batch").unwrap();
        writer.finish().unwrap();
        staging.mark_consumed("outgoing/001/1").unwrap();

        let job = PurgeJob::new(Arc::clone(&staging));
        assert_eq!(job.action(), PURGE);
        assert_eq!(job.run().await.unwrap(), 1);
        assert!(staging.resource_paths().is_empty());
    }
}
