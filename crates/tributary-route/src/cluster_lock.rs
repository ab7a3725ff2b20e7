//! Cluster lock: a lock-table row per action, leased by one server at a time.
//!
//! Acquisition is a single conditional UPDATE; success means exactly one row
//! changed. A crashed holder is overtaken once its lease times out, so actions
//! guarded by the lock must tolerate a rare duplicate execution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use duckdb::params;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::current_time_ms;
use crate::db::Database;
use crate::error::{RouteError, RouteResult};

/// Action key of the routing job.
pub const ROUTE: &str = "ROUTE";
/// Action key of the staging purge job.
pub const PURGE: &str = "PURGE";
/// Action key of the push job.
pub const PUSH: &str = "PUSH";
/// Action key of the pull job.
pub const PULL: &str = "PULL";
/// Action key of the heartbeat job.
pub const HEARTBEAT: &str = "HEARTBEAT";

/// Lock id shared by every server of the cluster.
pub const COMMON_LOCK_ID: &str = "common";
/// Holder written by an operator stop.
pub const STOPPED_SERVER_ID: &str = "STOPPED";

const ONE_HUNDRED_YEARS_MS: i64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Every action that gets a lock row at startup.
pub const ACTIONS: &[&str] = &[ROUTE, PURGE, PUSH, PULL, HEARTBEAT];

/// One row of the lock table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterLockRow {
    /// Lock id.
    pub lock_id: String,
    /// Action key.
    pub lock_action: String,
    /// Current holder.
    pub locking_server_id: Option<String>,
    /// When the current holder took the lock (ms since epoch).
    pub lock_time_ms: Option<i64>,
    /// Previous holder.
    pub last_locking_server_id: Option<String>,
    /// When the previous holder took the lock (ms since epoch).
    pub last_lock_time_ms: Option<i64>,
}

impl ClusterLockRow {
    fn empty(action: &str, lock_id: &str) -> Self {
        Self {
            lock_id: lock_id.to_string(),
            lock_action: action.to_string(),
            locking_server_id: None,
            lock_time_ms: None,
            last_locking_server_id: None,
            last_lock_time_ms: None,
        }
    }

    /// Returns true if an operator stopped the action.
    pub fn is_stopped(&self) -> bool {
        self.locking_server_id.as_deref() == Some(STOPPED_SERVER_ID)
    }
}

enum LockBackend {
    Table(Database),
    Local(Mutex<HashMap<(String, String), ClusterLockRow>>),
}

/// Lease-based lock over named actions.
pub struct ClusterLockService {
    backend: LockBackend,
    server_id: String,
    lock_timeout_ms: i64,
    refresh_ms: i64,
    guarded: Mutex<HashSet<(String, String)>>,
}

impl ClusterLockService {
    /// Locks kept in the shared `cluster_lock` table.
    pub fn new(db: Database, server_id: &str, lock_timeout_ms: i64, refresh_ms: i64) -> Self {
        Self {
            backend: LockBackend::Table(db),
            server_id: server_id.to_string(),
            lock_timeout_ms,
            refresh_ms,
            guarded: Mutex::new(HashSet::new()),
        }
    }

    /// Locks kept in this process only, for single-server deployments.
    pub fn local(server_id: &str, lock_timeout_ms: i64, refresh_ms: i64) -> Self {
        Self {
            backend: LockBackend::Local(Mutex::new(HashMap::new())),
            server_id: server_id.to_string(),
            lock_timeout_ms,
            refresh_ms,
            guarded: Mutex::new(HashSet::new()),
        }
    }

    /// Identity written into rows this service holds.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Returns true when backed by the shared table.
    pub fn is_clustered(&self) -> bool {
        matches!(self.backend, LockBackend::Table(_))
    }

    /// Startup: create the lock rows of every known action and drop any lock
    /// this server still held before a restart.
    pub fn init(&self) -> RouteResult<()> {
        for action in ACTIONS {
            self.init_lock(action, COMMON_LOCK_ID)?;
        }
        let cleared = match &self.backend {
            LockBackend::Table(db) => db.with_conn(|conn| {
                Ok(conn.execute(
                    "UPDATE cluster_lock SET locking_server_id = NULL, lock_time = NULL \
                     WHERE locking_server_id = ?",
                    params![self.server_id],
                )?)
            })?,
            LockBackend::Local(locks) => {
                let mut locks = locks.lock();
                let mut cleared = 0;
                for row in locks.values_mut() {
                    if row.locking_server_id.as_deref() == Some(self.server_id.as_str()) {
                        row.locking_server_id = None;
                        row.lock_time_ms = None;
                        cleared += 1;
                    }
                }
                cleared
            }
        };
        if cleared > 0 {
            info!(server_id = %self.server_id, cleared, "cleared locks left over from a previous run");
        }
        Ok(())
    }

    /// Create the lock row for an action if it does not exist yet.
    pub fn init_lock(&self, action: &str, lock_id: &str) -> RouteResult<()> {
        match &self.backend {
            LockBackend::Table(db) => db.with_conn(|conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO cluster_lock (lock_id, lock_action) VALUES (?, ?)",
                    params![lock_id, action],
                )?;
                Ok(())
            }),
            LockBackend::Local(locks) => {
                locks
                    .lock()
                    .entry((action.to_string(), lock_id.to_string()))
                    .or_insert_with(|| ClusterLockRow::empty(action, lock_id));
                Ok(())
            }
        }
    }

    /// Try to take the lock. Returns `Ok(false)` when another live server
    /// holds it; contention is not an error.
    pub fn try_acquire(&self, action: &str, lock_id: &str) -> RouteResult<bool> {
        let now = current_time_ms();
        let expired_before = now - self.lock_timeout_ms;
        let acquired = match &self.backend {
            LockBackend::Table(db) => {
                let result = db.with_conn(|conn| {
                    Ok(conn.execute(
                        "UPDATE cluster_lock SET locking_server_id = ?, lock_time = ? \
                         WHERE lock_id = ? AND lock_action = ? \
                         AND (locking_server_id IS NULL OR locking_server_id = ? OR lock_time < ?)",
                        params![self.server_id, now, lock_id, action, self.server_id, expired_before],
                    )?)
                });
                match result {
                    Ok(updated) => updated == 1,
                    Err(e) if is_conflict(&e) => {
                        debug!(action, lock_id, error = %e, "lock update conflicted with another server");
                        false
                    }
                    Err(e) => return Err(e),
                }
            }
            LockBackend::Local(locks) => {
                let mut locks = locks.lock();
                let row = locks
                    .entry((action.to_string(), lock_id.to_string()))
                    .or_insert_with(|| ClusterLockRow::empty(action, lock_id));
                let free = match (&row.locking_server_id, row.lock_time_ms) {
                    (None, _) => true,
                    (Some(holder), _) if *holder == self.server_id => true,
                    (Some(_), Some(time)) => time < expired_before,
                    (Some(_), None) => true,
                };
                if free {
                    row.locking_server_id = Some(self.server_id.clone());
                    row.lock_time_ms = Some(now);
                }
                free
            }
        };
        debug!(action, lock_id, server_id = %self.server_id, acquired, "lock acquire attempt");
        Ok(acquired)
    }

    /// Give the lock back. Only a lock held by this server is cleared; a
    /// lock that was taken over after our lease expired is left alone.
    pub fn release(&self, action: &str, lock_id: &str) -> RouteResult<bool> {
        let released = match &self.backend {
            LockBackend::Table(db) => db.with_conn(|conn| {
                Ok(conn.execute(
                    "UPDATE cluster_lock SET last_locking_server_id = locking_server_id, \
                     last_lock_time = lock_time, locking_server_id = NULL, lock_time = NULL \
                     WHERE lock_id = ? AND lock_action = ? AND locking_server_id = ?",
                    params![lock_id, action, self.server_id],
                )?)
            })? == 1,
            LockBackend::Local(locks) => {
                let mut locks = locks.lock();
                match locks.get_mut(&(action.to_string(), lock_id.to_string())) {
                    Some(row) if row.locking_server_id.as_deref() == Some(self.server_id.as_str()) => {
                        row.last_locking_server_id = row.locking_server_id.take();
                        row.last_lock_time_ms = row.lock_time_ms.take();
                        true
                    }
                    _ => false,
                }
            }
        };
        if !released {
            warn!(action, lock_id, server_id = %self.server_id, "released a lock this server did not hold");
        }
        Ok(released)
    }

    /// Renew the lease of a lock this server holds once it is older than the
    /// refresh period. Returns true if the lease was renewed.
    pub fn refresh(&self, action: &str, lock_id: &str) -> RouteResult<bool> {
        let now = current_time_ms();
        let older_than = now - self.refresh_ms;
        let refreshed = match &self.backend {
            LockBackend::Table(db) => db.with_conn(|conn| {
                Ok(conn.execute(
                    "UPDATE cluster_lock SET lock_time = ? \
                     WHERE lock_id = ? AND lock_action = ? AND locking_server_id = ? AND lock_time < ?",
                    params![now, lock_id, action, self.server_id, older_than],
                )?)
            })? == 1,
            LockBackend::Local(locks) => {
                let mut locks = locks.lock();
                match locks.get_mut(&(action.to_string(), lock_id.to_string())) {
                    Some(row)
                        if row.locking_server_id.as_deref() == Some(self.server_id.as_str())
                            && row.lock_time_ms.map_or(true, |t| t < older_than) =>
                    {
                        row.lock_time_ms = Some(now);
                        true
                    }
                    _ => false,
                }
            }
        };
        if refreshed {
            debug!(action, lock_id, "refreshed lock lease");
        }
        Ok(refreshed)
    }

    /// Stop an action cluster-wide: the row is held by [`STOPPED_SERVER_ID`]
    /// with a lock time far in the future, so no lease ever expires.
    pub fn acquire_infinite(&self, action: &str, lock_id: &str) -> RouteResult<bool> {
        self.init_lock(action, lock_id)?;
        let until = current_time_ms() + ONE_HUNDRED_YEARS_MS;
        let stopped = match &self.backend {
            LockBackend::Table(db) => db.with_conn(|conn| {
                Ok(conn.execute(
                    "UPDATE cluster_lock SET locking_server_id = ?, lock_time = ? \
                     WHERE lock_id = ? AND lock_action = ?",
                    params![STOPPED_SERVER_ID, until, lock_id, action],
                )?)
            })? == 1,
            LockBackend::Local(locks) => {
                let mut locks = locks.lock();
                match locks.get_mut(&(action.to_string(), lock_id.to_string())) {
                    Some(row) => {
                        row.locking_server_id = Some(STOPPED_SERVER_ID.to_string());
                        row.lock_time_ms = Some(until);
                        true
                    }
                    None => false,
                }
            }
        };
        info!(action, lock_id, "action stopped until cleared");
        Ok(stopped)
    }

    /// Lift an operator stop.
    pub fn clear_infinite(&self, action: &str, lock_id: &str) -> RouteResult<bool> {
        let cleared = match &self.backend {
            LockBackend::Table(db) => db.with_conn(|conn| {
                Ok(conn.execute(
                    "UPDATE cluster_lock SET locking_server_id = NULL, lock_time = NULL \
                     WHERE lock_id = ? AND lock_action = ? AND locking_server_id = ?",
                    params![lock_id, action, STOPPED_SERVER_ID],
                )?)
            })? == 1,
            LockBackend::Local(locks) => {
                let mut locks = locks.lock();
                match locks.get_mut(&(action.to_string(), lock_id.to_string())) {
                    Some(row) if row.is_stopped() => {
                        row.locking_server_id = None;
                        row.lock_time_ms = None;
                        true
                    }
                    _ => false,
                }
            }
        };
        if cleared {
            info!(action, lock_id, "action resumed");
        }
        Ok(cleared)
    }

    /// Returns true while an operator stop is in place.
    pub fn is_infinite_locked(&self, action: &str, lock_id: &str) -> RouteResult<bool> {
        Ok(self
            .find_locks()?
            .iter()
            .any(|row| row.lock_action == action && row.lock_id == lock_id && row.is_stopped()))
    }

    /// Every lock row, ordered by action then lock id.
    pub fn find_locks(&self) -> RouteResult<Vec<ClusterLockRow>> {
        match &self.backend {
            LockBackend::Table(db) => db.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT lock_id, lock_action, locking_server_id, lock_time, \
                     last_locking_server_id, last_lock_time FROM cluster_lock \
                     ORDER BY lock_action, lock_id",
                )?;
                let mut rows = stmt.query([])?;
                let mut locks = Vec::new();
                while let Some(row) = rows.next()? {
                    locks.push(ClusterLockRow {
                        lock_id: row.get(0)?,
                        lock_action: row.get(1)?,
                        locking_server_id: row.get(2)?,
                        lock_time_ms: row.get(3)?,
                        last_locking_server_id: row.get(4)?,
                        last_lock_time_ms: row.get(5)?,
                    });
                }
                Ok(locks)
            }),
            LockBackend::Local(locks) => {
                let mut rows: Vec<ClusterLockRow> = locks.lock().values().cloned().collect();
                rows.sort_by(|a, b| (&a.lock_action, &a.lock_id).cmp(&(&b.lock_action, &b.lock_id)));
                Ok(rows)
            }
        }
    }

    /// Take the lock and return a guard that releases it when dropped.
    ///
    /// The table row alone lets a server re-enter a lock it holds, so a lock
    /// with a live guard in this process is refused as well.
    pub fn guard(self: &Arc<Self>, action: &str, lock_id: &str) -> RouteResult<Option<ClusterLockGuard>> {
        let key = (action.to_string(), lock_id.to_string());
        if !self.guarded.lock().insert(key.clone()) {
            debug!(action, lock_id, "lock already guarded in this process");
            return Ok(None);
        }
        match self.try_acquire(action, lock_id) {
            Ok(true) => Ok(Some(ClusterLockGuard {
                service: Arc::clone(self),
                action: key.0,
                lock_id: key.1,
            })),
            Ok(false) => {
                self.guarded.lock().remove(&key);
                Ok(None)
            }
            Err(e) => {
                self.guarded.lock().remove(&key);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ClusterLockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterLockService")
            .field("server_id", &self.server_id)
            .field("clustered", &self.is_clustered())
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .finish()
    }
}

/// DuckDB reports a write-write conflict as a statement failure with a
/// generic error code; only the message names the conflict.
fn is_conflict(err: &RouteError) -> bool {
    match err {
        RouteError::Database(duckdb::Error::DuckDBFailure(_, Some(msg))) => {
            msg.to_ascii_lowercase().contains("conflict")
        }
        _ => false,
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct ClusterLockGuard {
    service: Arc<ClusterLockService>,
    action: String,
    lock_id: String,
}

impl ClusterLockGuard {
    /// Action this guard holds.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Renew the lease during a long run.
    pub fn refresh(&self) -> RouteResult<bool> {
        self.service.refresh(&self.action, &self.lock_id)
    }
}

impl Drop for ClusterLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.service.release(&self.action, &self.lock_id) {
            warn!(action = %self.action, lock_id = %self.lock_id, error = %e, "failed to release lock");
        }
        self.service
            .guarded
            .lock()
            .remove(&(self.action.clone(), self.lock_id.clone()));
    }
}
