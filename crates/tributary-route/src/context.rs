//! Per-run, per-channel routing state.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::info;
use tributary_stage::StagingManager;

use crate::batch::OpenBatch;
use crate::model::ChannelPolicy;
use crate::reader::ReaderStats;

/// Counters and timings of one channel's run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteStats {
    /// Rows accepted by the reader.
    pub data_read: u64,
    /// Rows the reader skipped as outside every gap.
    pub data_reread: u64,
    /// Time the reader spent on accepted rows.
    pub read_data_ms: u64,
    /// Time the reader spent on skipped rows.
    pub reread_data_ms: u64,
    /// Time the reader waited for queue room.
    pub enqueue_data_ms: u64,
    /// Rows routed.
    pub data_routed_count: u64,
    /// Batch rows written.
    pub data_events_inserted: u64,
    /// Rows skipped as corrupt.
    pub data_errors: u64,
    /// Batches handed to the sink.
    pub batches_closed: u64,
    /// Wall time of the run.
    pub route_total_ms: u64,
}

/// Transient state of routing one channel. Never persisted.
#[derive(Debug)]
pub struct RouterContext {
    /// Policy snapshot taken at the start of the run.
    pub channel: ChannelPolicy,
    /// Batches being filled, by target node.
    pub open_batches: BTreeMap<String, OpenBatch>,
    /// Counters.
    pub stats: RouteStats,
    /// Transaction of the last routed row.
    pub last_transaction_id: Option<String>,
    /// The last routed row closed its transaction.
    pub encountered_boundary: bool,
    /// A batch reached the point where the open batches must be closed.
    pub needs_commit: bool,
    /// Id of the last row taken from the reader.
    pub last_data_id_processed: Option<i64>,
    /// Ids of rows whose batches reached the sink, plus corrupt rows skipped
    /// before the last commit.
    pub committed_data_ids: Vec<i64>,
    /// Corrupt rows skipped since the last commit.
    pub skipped_data_ids: Vec<i64>,
    started: Instant,
}

impl RouterContext {
    /// Fresh context for `channel`.
    pub fn new(channel: ChannelPolicy) -> Self {
        Self {
            channel,
            open_batches: BTreeMap::new(),
            stats: RouteStats::default(),
            last_transaction_id: None,
            encountered_boundary: false,
            needs_commit: false,
            last_data_id_processed: None,
            committed_data_ids: Vec::new(),
            skipped_data_ids: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Channel being routed.
    pub fn channel_id(&self) -> &str {
        &self.channel.channel_id
    }

    /// Fold the reader's counters into the run's.
    pub fn absorb(&mut self, reader: &ReaderStats) {
        self.stats.data_read += reader.data_read;
        self.stats.data_reread += reader.data_reread;
        self.stats.read_data_ms += reader.read_data_ms;
        self.stats.reread_data_ms += reader.reread_data_ms;
        self.stats.enqueue_data_ms += reader.enqueue_data_ms;
        self.stats.data_errors += reader.data_corrupt;
    }

    /// Stop the clock.
    pub fn finish_timing(&mut self) -> u64 {
        self.stats.route_total_ms = self.started.elapsed().as_millis() as u64;
        self.stats.route_total_ms
    }

    /// Drop every open batch and its partial payload.
    pub fn abandon_batches(&mut self, staging: &StagingManager) {
        for (_, batch) in std::mem::take(&mut self.open_batches) {
            batch.abandon(staging);
        }
        self.skipped_data_ids.clear();
    }

    /// Log the run summary.
    pub fn log_stats(&self) {
        let s = &self.stats;
        info!(
            channel_id = %self.channel.channel_id,
            data_read = s.data_read,
            data_reread = s.data_reread,
            data_routed = s.data_routed_count,
            data_events = s.data_events_inserted,
            data_errors = s.data_errors,
            batches = s.batches_closed,
            read_data_ms = s.read_data_ms,
            reread_data_ms = s.reread_data_ms,
            enqueue_data_ms = s.enqueue_data_ms,
            route_total_ms = s.route_total_ms,
            "routed channel"
        );
    }
}
