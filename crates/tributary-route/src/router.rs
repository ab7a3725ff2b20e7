//! Routing service: drains the gapped reader of each channel into outgoing
//! batches and confirms the routed ids to the gap registry.
//!
//! Rows are taken one ahead of the row being routed, so a row knows whether
//! the next one continues its transaction. Open batches only close after a
//! row for which the channel's batch algorithm reports completion; for the
//! transactional algorithms that is always a transaction boundary.
//!
//! Closed batches are handed to a [`BatchSink`] as they complete. Routed ids
//! are confirmed only after every channel of the run succeeded, so a failed
//! run leaves the gaps untouched and its rows are read again by the next run.

use std::collections::HashMap;
use std::sync::Arc;

use duckdb::params;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tributary_stage::StagingManager;

use crate::batch::{payload_lines, ClosedBatch, OpenBatch, OutgoingBatch, UNROUTED_NODE_ID};
use crate::cluster_lock::{ClusterLockService, COMMON_LOCK_ID, ROUTE};
use crate::config::RouteConfig;
use crate::context::RouterContext;
use crate::current_time_ms;
use crate::data_router::{DataRouter, DefaultDataRouter};
use crate::db::Database;
use crate::error::{RouteError, RouteResult};
use crate::gap_registry::{GapRegistry, SqlGapRegistry};
use crate::model::{ChangeRecord, ChannelPolicy, DataGap, TriggerHistory};
use crate::reader::{spawn_reader, ReaderHandle, ReaderSettings};
use crate::statistics::{ChannelStatistics, StatisticsSink};

/// Receives closed batches for extraction and transport.
pub trait BatchSink: Send + Sync {
    /// Take ownership of a closed batch. An error aborts the channel's run.
    fn accept(&self, batch: &ClosedBatch) -> RouteResult<()>;
}

/// Records closed batches in the `outgoing_batch` table.
#[derive(Debug, Clone)]
pub struct SqlBatchSink {
    db: Database,
}

impl SqlBatchSink {
    /// Sink writing to `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Recorded batches, newest first.
    pub fn recorded(&self, limit: usize) -> RouteResult<Vec<BatchRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT batch_id, node_id, channel_id, status, data_event_count, staged_path, create_time \
                 FROM outgoing_batch ORDER BY batch_id DESC LIMIT ?",
            )?;
            let mut rows = stmt.query(params![limit as i64])?;
            let mut batches = Vec::new();
            while let Some(row) = rows.next()? {
                batches.push(BatchRecord {
                    batch_id: row.get(0)?,
                    node_id: row.get(1)?,
                    channel_id: row.get(2)?,
                    status: row.get(3)?,
                    data_event_count: row.get(4)?,
                    staged_path: row.get(5)?,
                    create_time_ms: row.get(6)?,
                });
            }
            Ok(batches)
        })
    }
}

/// A row of the `outgoing_batch` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchRecord {
    /// Batch identity.
    pub batch_id: i64,
    /// Target node.
    pub node_id: String,
    /// Channel.
    pub channel_id: String,
    /// Status code.
    pub status: String,
    /// Rows in the batch.
    pub data_event_count: i64,
    /// Staged payload path.
    pub staged_path: Option<String>,
    /// When the batch was opened (ms since epoch).
    pub create_time_ms: i64,
}

impl BatchSink for SqlBatchSink {
    fn accept(&self, batch: &ClosedBatch) -> RouteResult<()> {
        let b = &batch.batch;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO outgoing_batch (batch_id, node_id, channel_id, status, data_event_count, \
                 staged_path, create_time) VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    b.batch_id,
                    b.node_id,
                    b.channel_id,
                    b.status.code(),
                    b.data_event_count as i64,
                    batch.staged_path,
                    b.create_time_ms,
                ],
            )?;
            Ok(())
        })
    }
}

/// Keeps closed batches in memory.
#[derive(Debug, Default)]
pub struct CollectingBatchSink {
    batches: Mutex<Vec<ClosedBatch>>,
}

impl CollectingBatchSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches accepted so far, in order.
    pub fn batches(&self) -> Vec<ClosedBatch> {
        self.batches.lock().clone()
    }

    /// Remove and return the accepted batches.
    pub fn take(&self) -> Vec<ClosedBatch> {
        std::mem::take(&mut *self.batches.lock())
    }
}

impl BatchSink for CollectingBatchSink {
    fn accept(&self, batch: &ClosedBatch) -> RouteResult<()> {
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}

/// Routes change rows of every enabled channel into outgoing batches.
pub struct RouterService {
    config: RouteConfig,
    db: Database,
    staging: Arc<StagingManager>,
    locks: Arc<ClusterLockService>,
    gaps: Arc<dyn GapRegistry>,
    data_router: Arc<dyn DataRouter>,
    sink: Arc<dyn BatchSink>,
    statistics: Arc<dyn StatisticsSink>,
    running: tokio::sync::Mutex<()>,
}

impl RouterService {
    /// Service over `db` and `staging` with the SQL gap registry and batch
    /// sink, the default data router and in-process statistics.
    pub fn new(config: RouteConfig, db: Database, staging: Arc<StagingManager>) -> Self {
        let server_id = config.resolve_server_id();
        let locks = if config.cluster_locking_enabled {
            ClusterLockService::new(
                db.clone(),
                &server_id,
                config.cluster_lock_timeout_ms,
                config.cluster_lock_refresh_ms,
            )
        } else {
            ClusterLockService::local(&server_id, config.cluster_lock_timeout_ms, config.cluster_lock_refresh_ms)
        };
        Self {
            gaps: Arc::new(SqlGapRegistry::new(db.clone(), config.stale_gap_timeout_ms)),
            data_router: Arc::new(DefaultDataRouter::new(&config.node_id)),
            sink: Arc::new(SqlBatchSink::new(db.clone())),
            statistics: Arc::new(ChannelStatistics::new()),
            running: tokio::sync::Mutex::new(()),
            locks: Arc::new(locks),
            config,
            db,
            staging,
        }
    }

    /// Open the database and staging directory named by `config`, install the
    /// schema and initialise the lock rows.
    pub fn from_config(config: RouteConfig) -> RouteResult<Self> {
        config.validate()?;
        let db = Database::open(&config.database_path)?;
        db.install_schema()?;
        let staging = StagingManager::new(
            config.staging_dir.clone(),
            config.staging_threshold_bytes,
            config.staging_ttl_ms,
        )?;
        let service = Self::new(config, db, Arc::new(staging));
        service.locks.init()?;
        Ok(service)
    }

    /// Replace the gap registry.
    pub fn with_gap_registry(mut self, gaps: Arc<dyn GapRegistry>) -> Self {
        self.gaps = gaps;
        self
    }

    /// Replace the data router.
    pub fn with_data_router(mut self, data_router: Arc<dyn DataRouter>) -> Self {
        self.data_router = data_router;
        self
    }

    /// Replace the batch sink.
    pub fn with_sink(mut self, sink: Arc<dyn BatchSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the statistics sink.
    pub fn with_statistics(mut self, statistics: Arc<dyn StatisticsSink>) -> Self {
        self.statistics = statistics;
        self
    }

    /// Replace the lock service.
    pub fn with_locks(mut self, locks: Arc<ClusterLockService>) -> Self {
        self.locks = locks;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    /// Database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Staging manager holding the batch payloads.
    pub fn staging(&self) -> &Arc<StagingManager> {
        &self.staging
    }

    /// Lock service.
    pub fn locks(&self) -> &Arc<ClusterLockService> {
        &self.locks
    }

    /// Gap registry.
    pub fn gap_registry(&self) -> &Arc<dyn GapRegistry> {
        &self.gaps
    }

    /// One routing run over every enabled channel. Skips the run and returns
    /// zero when another server holds the route lock, unless `force` is set,
    /// or when a run of this service is already in progress.
    /// Returns the number of rows routed.
    pub async fn route_data(&self, force: bool) -> RouteResult<usize> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("routing run already in progress, skipping run");
            return Ok(0);
        };
        let guard = if force {
            None
        } else {
            match self.locks.guard(ROUTE, COMMON_LOCK_ID)? {
                Some(guard) => Some(guard),
                None => {
                    if self.locks.is_infinite_locked(ROUTE, COMMON_LOCK_ID)? {
                        info!("route action is stopped, skipping run");
                    } else {
                        debug!("route lock is held by another server, skipping run");
                    }
                    return Ok(0);
                }
            }
        };

        let gaps = self.gaps.find_gaps()?;
        let histories = self.db.trigger_histories()?;
        let mut routed_ids = Vec::new();
        let mut routed = 0u64;

        for channel in self.config.channels.iter().filter(|c| c.enabled) {
            let ctx = match self.route_channel(&gaps, channel, &histories).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    error!(channel_id = %channel.channel_id, error = %e, "routing run failed");
                    return Err(e);
                }
            };
            routed += ctx.stats.data_routed_count;
            routed_ids.extend(ctx.committed_data_ids);
            if let Some(guard) = &guard {
                guard.refresh()?;
            }
        }

        routed_ids.sort_unstable();
        routed_ids.dedup();
        let changes = self.gaps.confirm_routed(&gaps, &routed_ids, current_time_ms())?;
        info!(
            routed,
            confirmed = routed_ids.len(),
            gaps_removed = changes.removed,
            gaps_inserted = changes.inserted,
            gaps_expired = changes.expired,
            "routing run complete"
        );
        Ok(routed as usize)
    }

    /// Route one channel's rows inside `gaps`. On success every batch opened
    /// by the run has reached the sink.
    pub async fn route_channel(
        &self,
        gaps: &[DataGap],
        channel: &ChannelPolicy,
        histories: &HashMap<i64, TriggerHistory>,
    ) -> RouteResult<RouterContext> {
        let mut ctx = RouterContext::new(channel.clone());
        let settings = ReaderSettings::for_channel(&self.config, channel);
        let mut reader = spawn_reader(&self.db, &channel.channel_id, gaps.to_vec(), settings)?;

        let drained = self.drain(&mut ctx, &mut reader, histories).await;
        let finished = reader.finish().await;
        let result = match (drained, finished) {
            (Ok(()), Ok(reader_stats)) => {
                ctx.absorb(&reader_stats);
                self.complete_batches(&mut ctx)
            }
            (Err(e), _) | (Ok(()), Err(e)) => Err(e),
        };
        if let Err(e) = result {
            ctx.abandon_batches(&self.staging);
            return Err(e);
        }

        let after_id = ctx
            .last_data_id_processed
            .or_else(|| gaps.first().map(|g| g.start_id.saturating_sub(1)))
            .unwrap_or(0);
        let unrouted = self.db.count_unrouted(&channel.channel_id, after_id)?;
        let elapsed = ctx.finish_timing();

        let channel_id = channel.channel_id.as_str();
        self.statistics.increment_data_routed(channel_id, ctx.stats.data_routed_count);
        self.statistics.increment_data_events(channel_id, ctx.stats.data_events_inserted);
        self.statistics.increment_data_errors(channel_id, ctx.stats.data_errors);
        self.statistics.set_data_unrouted(channel_id, unrouted.max(0) as u64);
        self.statistics.record_route_time(channel_id, elapsed);
        ctx.log_stats();
        Ok(ctx)
    }

    async fn drain(
        &self,
        ctx: &mut RouterContext,
        reader: &mut ReaderHandle,
        histories: &HashMap<i64, TriggerHistory>,
    ) -> RouteResult<()> {
        let mut next = reader.take().await?;
        while let Some(record) = next.take() {
            next = reader.take().await?;
            let boundary = match (&record.transaction_id, &next) {
                (Some(tx), Some(following)) => following.transaction_id.as_ref() != Some(tx),
                _ => true,
            };

            self.route_record(ctx, &record, histories)?;
            ctx.last_data_id_processed = Some(record.data_id);
            ctx.last_transaction_id = record.transaction_id.clone();
            ctx.encountered_boundary = boundary;

            let algorithm = ctx.channel.batch_algorithm;
            let max = ctx.channel.max_batch_size;
            ctx.needs_commit = ctx
                .open_batches
                .values()
                .any(|batch| algorithm.is_batch_complete(batch.rows(), max, boundary));
            if ctx.needs_commit {
                self.complete_batches(ctx)?;
            }
        }
        Ok(())
    }

    fn route_record(
        &self,
        ctx: &mut RouterContext,
        record: &ChangeRecord,
        histories: &HashMap<i64, TriggerHistory>,
    ) -> RouteResult<()> {
        let history = histories.get(&record.trigger_hist_id);
        let lines = match payload_lines(record, history) {
            Ok(lines) => lines,
            Err(reason) => {
                warn!(
                    channel_id = %ctx.channel.channel_id,
                    data_id = record.data_id,
                    reason = %reason,
                    "skipping corrupt change row"
                );
                ctx.stats.data_errors += 1;
                ctx.skipped_data_ids.push(record.data_id);
                return Ok(());
            }
        };
        let Some(history) = history else {
            return Ok(());
        };

        let mut nodes = self.data_router.route_to_nodes(record, &self.config.target_nodes);
        if nodes.is_empty() {
            nodes.push(UNROUTED_NODE_ID.to_string());
        }
        for node_id in nodes {
            if !ctx.open_batches.contains_key(&node_id) {
                let batch = OutgoingBatch::new(
                    self.db.next_batch_id()?,
                    &node_id,
                    &ctx.channel.channel_id,
                    current_time_ms(),
                );
                let open = OpenBatch::open(&self.staging, &self.config.node_id, batch)?;
                ctx.open_batches.insert(node_id.clone(), open);
            }
            if let Some(batch) = ctx.open_batches.get_mut(&node_id) {
                batch.append(record, history, &lines)?;
                ctx.stats.data_events_inserted += 1;
            }
        }
        ctx.stats.data_routed_count += 1;
        Ok(())
    }

    /// Close every open batch and hand it to the sink. On failure the
    /// batches not yet handed over are abandoned.
    fn complete_batches(&self, ctx: &mut RouterContext) -> RouteResult<()> {
        let mut pending = std::mem::take(&mut ctx.open_batches).into_iter();
        while let Some((_, open)) = pending.next() {
            match self.hand_over(open) {
                Ok(closed) => {
                    ctx.committed_data_ids.extend_from_slice(&closed.batch.data_ids);
                    ctx.stats.batches_closed += 1;
                }
                Err(e) => {
                    for (_, rest) in pending {
                        rest.abandon(&self.staging);
                    }
                    return Err(e);
                }
            }
        }
        ctx.committed_data_ids.append(&mut ctx.skipped_data_ids);
        ctx.needs_commit = false;
        Ok(())
    }

    fn hand_over(&self, open: OpenBatch) -> RouteResult<ClosedBatch> {
        let closed = open.close()?;
        if let Err(e) = self.sink.accept(&closed) {
            if let Some(path) = &closed.staged_path {
                if let Err(delete_err) = self.staging.delete(path) {
                    warn!(path = %path, error = %delete_err, "failed to delete rejected batch payload");
                }
            }
            return Err(match e {
                RouteError::BatchRejected { .. } => e,
                other => RouteError::BatchRejected {
                    batch_id: closed.batch_id(),
                    msg: other.to_string(),
                },
            });
        }
        debug!(
            batch_id = closed.batch_id(),
            node_id = %closed.node_id(),
            channel_id = %closed.channel_id(),
            rows = closed.row_count(),
            "closed batch"
        );
        Ok(closed)
    }
}

impl std::fmt::Debug for RouterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterService")
            .field("node_id", &self.config.node_id)
            .field("db", &self.db)
            .field("locks", &self.locks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_algorithm::BatchAlgorithm;
    use crate::model::EventType;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        service: RouterService,
        sink: Arc<CollectingBatchSink>,
    }

    fn fixture(channel: ChannelPolicy, targets: &[&str]) -> Fixture {
        let dir = tempdir().unwrap();
        let config = RouteConfig {
            node_id: "000".to_string(),
            target_nodes: targets.iter().map(|t| t.to_string()).collect(),
            channels: vec![channel],
            server_id: Some("test-server".to_string()),
            ..RouteConfig::default()
        };
        let db = Database::open_in_memory().unwrap();
        db.insert_trigger_history(&TriggerHistory::new(1, "orders", &["id", "status"], &["id"]))
            .unwrap();
        let staging = Arc::new(StagingManager::new(dir.path(), 1024, 60_000).unwrap());
        let sink = Arc::new(CollectingBatchSink::new());
        let service = RouterService::new(config, db, staging).with_sink(sink.clone());
        service.locks().init().unwrap();
        Fixture {
            _dir: dir,
            service,
            sink,
        }
    }

    fn insert(service: &RouterService, id: i64, tx: Option<&str>) {
        let mut record = ChangeRecord::new(id, "orders", EventType::Insert, "default")
            .with_row_data(&format!("\"{id}\",\"open\""))
            .with_trigger_hist(1);
        if let Some(tx) = tx {
            record = record.with_transaction(tx);
        }
        service.database().insert_change(&record).unwrap();
    }

    #[tokio::test]
    async fn test_batches_close_at_transaction_boundaries() {
        let f = fixture(ChannelPolicy::new("default").with_max_batch_size(2), &["001"]);
        insert(&f.service, 1, Some("T1"));
        insert(&f.service, 2, Some("T1"));
        insert(&f.service, 3, Some("T1"));
        insert(&f.service, 4, None);

        assert_eq!(f.service.route_data(false).await.unwrap(), 4);
        let batches = f.sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].batch.data_ids, vec![1, 2, 3]);
        assert_eq!(batches[1].batch.data_ids, vec![4]);
    }

    #[tokio::test]
    async fn test_nontransactional_splits_at_threshold() {
        let channel = ChannelPolicy::new("default")
            .with_max_batch_size(2)
            .with_algorithm(BatchAlgorithm::NonTransactional);
        let f = fixture(channel, &["001"]);
        for id in 1..=3 {
            insert(&f.service, id, Some("T1"));
        }
        f.service.route_data(false).await.unwrap();
        let sizes: Vec<usize> = f.sink.batches().iter().map(|b| b.row_count()).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_per_transaction_batches() {
        let channel = ChannelPolicy::new("default").with_algorithm(BatchAlgorithm::PerTransaction);
        let f = fixture(channel, &["001"]);
        insert(&f.service, 1, Some("T1"));
        insert(&f.service, 2, Some("T1"));
        insert(&f.service, 3, Some("T2"));
        f.service.route_data(false).await.unwrap();
        let ids: Vec<Vec<i64>> = f.sink.batches().iter().map(|b| b.batch.data_ids.clone()).collect();
        assert_eq!(ids, vec![vec![1, 2], vec![3]]);
    }

    #[tokio::test]
    async fn test_routed_ids_leave_the_gaps() {
        let f = fixture(ChannelPolicy::new("default"), &["001"]);
        insert(&f.service, 1, None);
        insert(&f.service, 2, None);
        assert_eq!(f.service.route_data(false).await.unwrap(), 2);
        assert_eq!(f.service.route_data(false).await.unwrap(), 0);
        let gaps = f.service.gap_registry().find_gaps().unwrap();
        assert!(gaps.iter().all(|g| !g.contains(1) && !g.contains(2)));
    }

    #[tokio::test]
    async fn test_run_skipped_while_lock_held() {
        let f = fixture(ChannelPolicy::new("default"), &["001"]);
        insert(&f.service, 1, None);
        let other = ClusterLockService::new(f.service.database().clone(), "other-server", 60_000, 30_000);
        other.init().unwrap();
        assert!(other.try_acquire(ROUTE, COMMON_LOCK_ID).unwrap());

        assert_eq!(f.service.route_data(false).await.unwrap(), 0);
        assert!(f.sink.batches().is_empty());
        assert_eq!(f.service.route_data(true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stopped_route_action_skips_until_resumed() {
        let f = fixture(ChannelPolicy::new("default"), &["001"]);
        insert(&f.service, 1, None);
        assert!(f.service.locks().acquire_infinite(ROUTE, COMMON_LOCK_ID).unwrap());

        assert_eq!(f.service.route_data(false).await.unwrap(), 0);
        assert!(f.sink.batches().is_empty());

        assert!(f.service.locks().clear_infinite(ROUTE, COMMON_LOCK_ID).unwrap());
        assert_eq!(f.service.route_data(false).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejecting_sink_aborts_without_confirming() {
        struct Rejecting;
        impl BatchSink for Rejecting {
            fn accept(&self, batch: &ClosedBatch) -> RouteResult<()> {
                Err(RouteError::BatchRejected {
                    batch_id: batch.batch_id(),
                    msg: "transport down".to_string(),
                })
            }
        }
        let f = fixture(ChannelPolicy::new("default"), &["001", "002"]);
        insert(&f.service, 1, None);
        let service = RouterService::new(
            f.service.config().clone(),
            f.service.database().clone(),
            f.service.staging().clone(),
        )
        .with_sink(Arc::new(Rejecting));

        let err = service.route_data(false).await.unwrap_err();
        assert!(matches!(err, RouteError::BatchRejected { .. }));
        assert!(service.staging().resource_paths().is_empty());
        let gaps = service.gap_registry().find_gaps().unwrap();
        assert!(gaps.iter().any(|g| g.contains(1)));
    }

    #[tokio::test]
    async fn test_sql_sink_records_batches() {
        let f = fixture(ChannelPolicy::new("default"), &[]);
        let sink = SqlBatchSink::new(f.service.database().clone());
        let service = RouterService::new(
            f.service.config().clone(),
            f.service.database().clone(),
            f.service.staging().clone(),
        );
        insert(&f.service, 1, None);
        insert(&f.service, 2, None);
        assert_eq!(service.route_data(false).await.unwrap(), 2);

        let recorded = sink.recorded(10).unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].node_id, UNROUTED_NODE_ID);
        assert_eq!(recorded[0].status, "OK");
        assert_eq!(recorded[0].data_event_count, 2);
        assert!(recorded[0].staged_path.is_none());
    }
}
