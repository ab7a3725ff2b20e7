//! Gap registry: the persisted set of log id ranges not yet confirmed as routed.
//!
//! A routing run reads the gaps once, routes whatever rows fall inside them,
//! and then confirms the routed ids. Confirmation replaces each gap that held
//! routed ids with the holes left between them, so ids whose transactions had
//! not committed at read time stay covered and are picked up by a later run.
//! Holes start a fresh stale clock; closed gaps that stay empty past the stale
//! timeout are dropped.

use std::collections::BTreeSet;

use duckdb::{params, Connection};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::RouteResult;
use crate::model::{DataGap, OPEN_END_ID};

/// Summary of one confirmation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GapChanges {
    /// Gaps deleted because routed ids fell inside them.
    pub removed: usize,
    /// Holes inserted in their place.
    pub inserted: usize,
    /// Empty gaps dropped after the stale timeout.
    pub expired: usize,
}

/// Source of gaps for the reader and sink of routing confirmations.
pub trait GapRegistry: Send + Sync {
    /// Current gaps ordered by start id. Never empty: a fresh registry holds
    /// the single open gap `[0, ..)`.
    fn find_gaps(&self) -> RouteResult<Vec<DataGap>>;

    /// Record that `routed_ids` are durably routed. `scanned` is the gap list
    /// the run read from; gaps holding none of the ids are kept unless stale.
    fn confirm_routed(&self, scanned: &[DataGap], routed_ids: &[i64], now_ms: i64) -> RouteResult<GapChanges>;
}

/// Planned mutation of the gap set.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GapPlan {
    /// Gaps to delete.
    pub delete: Vec<DataGap>,
    /// Gaps to insert.
    pub insert: Vec<DataGap>,
    /// Deleted gaps that expired rather than being split.
    pub expired: usize,
}

/// Work out the gap mutation for a confirmation. `has_rows(start, end)`
/// reports whether the change log holds any row in the inclusive range.
pub fn plan_confirmation(
    scanned: &[DataGap],
    routed_ids: &[i64],
    now_ms: i64,
    stale_timeout_ms: i64,
    mut has_rows: impl FnMut(i64, i64) -> RouteResult<bool>,
) -> RouteResult<GapPlan> {
    let routed: BTreeSet<i64> = routed_ids.iter().copied().collect();
    let mut plan = GapPlan::default();

    for gap in scanned {
        let inside: Vec<i64> = routed.range(gap.start_id..=gap.end_id).copied().collect();
        if inside.is_empty() {
            let stale = !gap.is_open_ended() && now_ms - gap.create_time_ms >= stale_timeout_ms;
            if stale && !has_rows(gap.start_id, gap.end_id)? {
                debug!(gap = %gap, "expiring empty gap");
                plan.delete.push(*gap);
                plan.expired += 1;
            }
            continue;
        }

        plan.delete.push(*gap);
        let mut next = gap.start_id;
        let mut covered_to_end = false;
        for id in inside {
            if id > next {
                plan.insert.push(DataGap::new(next, id - 1, now_ms));
            }
            match id.checked_add(1) {
                Some(after) => next = after,
                None => covered_to_end = true,
            }
        }
        if !covered_to_end && next <= gap.end_id {
            plan.insert.push(DataGap::new(next, gap.end_id, now_ms));
        }
    }
    Ok(plan)
}

/// Gap registry over the `data_gap` table.
#[derive(Debug, Clone)]
pub struct SqlGapRegistry {
    db: Database,
    stale_gap_timeout_ms: i64,
}

impl SqlGapRegistry {
    /// Registry over `db`'s gap table.
    pub fn new(db: Database, stale_gap_timeout_ms: i64) -> Self {
        Self {
            db,
            stale_gap_timeout_ms,
        }
    }

    /// Replace the gap set, for setup and tests.
    pub fn replace_gaps(&self, gaps: &[DataGap]) -> RouteResult<()> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM data_gap", [])?;
            for gap in gaps {
                insert_gap(&tx, gap)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn load(conn: &Connection) -> RouteResult<Vec<DataGap>> {
        let mut stmt = conn.prepare(
            "SELECT start_id, end_id, create_time, last_update_time FROM data_gap ORDER BY start_id",
        )?;
        let mut rows = stmt.query([])?;
        let mut gaps = Vec::new();
        while let Some(row) = rows.next()? {
            gaps.push(DataGap {
                start_id: row.get(0)?,
                end_id: row.get(1)?,
                create_time_ms: row.get(2)?,
                last_update_time_ms: row.get(3)?,
            });
        }
        Ok(gaps)
    }
}

fn insert_gap(conn: &Connection, gap: &DataGap) -> RouteResult<()> {
    conn.execute(
        "INSERT INTO data_gap (start_id, end_id, create_time, last_update_time) VALUES (?, ?, ?, ?)",
        params![gap.start_id, gap.end_id, gap.create_time_ms, gap.last_update_time_ms],
    )?;
    Ok(())
}

impl GapRegistry for SqlGapRegistry {
    fn find_gaps(&self) -> RouteResult<Vec<DataGap>> {
        self.db.with_conn(|conn| {
            let gaps = Self::load(conn)?;
            if !gaps.is_empty() {
                return Ok(gaps);
            }
            let seed = DataGap::new(0, OPEN_END_ID, crate::current_time_ms());
            insert_gap(conn, &seed)?;
            info!(gap = %seed, "no gaps recorded, seeded the open gap");
            Ok(vec![seed])
        })
    }

    fn confirm_routed(&self, scanned: &[DataGap], routed_ids: &[i64], now_ms: i64) -> RouteResult<GapChanges> {
        let stale_timeout = self.stale_gap_timeout_ms;
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let plan = plan_confirmation(scanned, routed_ids, now_ms, stale_timeout, |start, end| {
                let count: i64 = tx.query_row(
                    "SELECT count(*) FROM change_log WHERE data_id BETWEEN ? AND ?",
                    params![start, end],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })?;
            for gap in &plan.delete {
                tx.execute(
                    "DELETE FROM data_gap WHERE start_id = ? AND end_id = ?",
                    params![gap.start_id, gap.end_id],
                )?;
            }
            for gap in &plan.insert {
                insert_gap(&tx, gap)?;
            }
            tx.commit()?;
            let changes = GapChanges {
                removed: plan.delete.len() - plan.expired,
                inserted: plan.insert.len(),
                expired: plan.expired,
            };
            debug!(?changes, routed = routed_ids.len(), "confirmed routed ids");
            Ok(changes)
        })
    }
}

/// Gap registry held in memory, with a set of ids standing in for the change log.
#[derive(Debug)]
pub struct InMemoryGapRegistry {
    gaps: Mutex<Vec<DataGap>>,
    log_ids: Mutex<BTreeSet<i64>>,
    stale_gap_timeout_ms: i64,
}

impl InMemoryGapRegistry {
    /// Registry starting from `gaps`.
    pub fn new(gaps: Vec<DataGap>, stale_gap_timeout_ms: i64) -> Self {
        Self {
            gaps: Mutex::new(gaps),
            log_ids: Mutex::new(BTreeSet::new()),
            stale_gap_timeout_ms,
        }
    }

    /// Record ids present in the change log.
    pub fn record_log_ids(&self, ids: &[i64]) {
        self.log_ids.lock().extend(ids.iter().copied());
    }
}

impl GapRegistry for InMemoryGapRegistry {
    fn find_gaps(&self) -> RouteResult<Vec<DataGap>> {
        let mut gaps = self.gaps.lock();
        if gaps.is_empty() {
            gaps.push(DataGap::new(0, OPEN_END_ID, crate::current_time_ms()));
        }
        gaps.sort_by_key(|g| g.start_id);
        Ok(gaps.clone())
    }

    fn confirm_routed(&self, scanned: &[DataGap], routed_ids: &[i64], now_ms: i64) -> RouteResult<GapChanges> {
        let plan = {
            let log_ids = self.log_ids.lock();
            plan_confirmation(scanned, routed_ids, now_ms, self.stale_gap_timeout_ms, |start, end| {
                Ok(log_ids.range(start..=end).next().is_some())
            })?
        };
        let mut gaps = self.gaps.lock();
        gaps.retain(|g| {
            !plan
                .delete
                .iter()
                .any(|d| d.start_id == g.start_id && d.end_id == g.end_id)
        });
        gaps.extend(plan.insert.iter().copied());
        gaps.sort_by_key(|g| g.start_id);
        Ok(GapChanges {
            removed: plan.delete.len() - plan.expired,
            inserted: plan.insert.len(),
            expired: plan.expired,
        })
    }
}
