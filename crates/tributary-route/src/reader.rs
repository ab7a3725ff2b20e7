//! Gapped log reader.
//!
//! Rows are selected from the change log restricted to the known gaps and
//! ordered by id, validated against the gap list one by one, and handed to the
//! router through a bounded channel. With transactional grouping the reader
//! keeps a peek-ahead buffer and drains every buffered row of the transaction
//! it last emitted before starting another one.
//!
//! The reader runs on a blocking thread and always finishes with
//! [`ReadEvent::EndOfData`], including when it fails, so the consumer can tell
//! "temporarily empty" from "done" without relying on the channel closing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use duckdb::types::Value;
use duckdb::{params_from_iter, Rows};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RouteConfig;
use crate::db::{map_change_row, Database, CHANGE_COLUMNS};
use crate::error::{RouteError, RouteResult};
use crate::model::{ChangeRecord, ChannelPolicy, DataGap};

/// Item passed from the reader to the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// A validated row.
    Data(ChangeRecord),
    /// The reader is done; nothing follows.
    EndOfData,
}

/// Ordered source of change rows.
pub trait DataCursor {
    /// Next row in id order, or `None` when exhausted.
    fn next_record(&mut self) -> RouteResult<Option<ChangeRecord>>;

    /// Rows dropped because they could not be decoded.
    fn corrupt_rows(&self) -> u64 {
        0
    }
}

/// Cursor over rows already in memory.
#[derive(Debug)]
pub struct VecCursor {
    rows: std::vec::IntoIter<ChangeRecord>,
}

impl VecCursor {
    /// Cursor yielding `rows` in the given order.
    pub fn new(rows: Vec<ChangeRecord>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl DataCursor for VecCursor {
    fn next_record(&mut self) -> RouteResult<Option<ChangeRecord>> {
        Ok(self.rows.next())
    }
}

/// Cursor over a change-log query.
pub struct RowsCursor<'stmt> {
    rows: Rows<'stmt>,
    corrupt: u64,
}

impl<'stmt> RowsCursor<'stmt> {
    /// Wrap query results selected with [`CHANGE_COLUMNS`].
    pub fn new(rows: Rows<'stmt>) -> Self {
        Self { rows, corrupt: 0 }
    }
}

impl DataCursor for RowsCursor<'_> {
    fn next_record(&mut self) -> RouteResult<Option<ChangeRecord>> {
        while let Some(row) = self.rows.next()? {
            match map_change_row(row)? {
                Ok(record) => return Ok(Some(record)),
                Err((data_id, code)) => {
                    warn!(data_id, code = %code, "skipping change row with unknown event type");
                    self.corrupt += 1;
                }
            }
        }
        Ok(None)
    }

    fn corrupt_rows(&self) -> u64 {
        self.corrupt
    }
}

/// Walks the gap list alongside an ascending id stream.
#[derive(Debug, Clone)]
pub struct GapCursor {
    gaps: Vec<DataGap>,
    current: usize,
}

impl GapCursor {
    /// Cursor positioned on the first gap.
    pub fn new(gaps: Vec<DataGap>) -> Self {
        Self { gaps, current: 0 }
    }

    /// Returns true if `data_id` lies in a gap. Ids must be presented in
    /// ascending order: passing a gap's end moves the cursor on for good.
    pub fn admit(&mut self, data_id: i64) -> bool {
        while let Some(gap) = self.gaps.get(self.current) {
            if data_id < gap.start_id {
                return false;
            }
            if data_id <= gap.end_id {
                return true;
            }
            self.current += 1;
        }
        false
    }
}

/// Counters and timings of one reader run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Rows accepted into the peek-ahead buffer.
    pub data_read: u64,
    /// Rows skipped because they fell outside every gap.
    pub data_reread: u64,
    /// Rows handed to the router.
    pub data_emitted: u64,
    /// Rows that could not be decoded.
    pub data_corrupt: u64,
    /// Time spent reading accepted rows.
    pub read_data_ms: u64,
    /// Time spent reading skipped rows.
    pub reread_data_ms: u64,
    /// Time spent waiting for room in the queue.
    pub enqueue_data_ms: u64,
    /// Whether the open-ended `data_id >=` query was used.
    pub used_greater_query: bool,
}

/// Knobs of one reader run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderSettings {
    /// Peek-ahead depth and queue capacity. A transaction is kept whole
    /// only while its rows are at most `window` rows apart; a row further
    /// back in the log is emitted later, in a separate group.
    pub window: usize,
    /// Keep same-transaction rows contiguous.
    pub group_transactions: bool,
    /// Row cap; the open transaction is still finished.
    pub max_data_to_route: usize,
    /// Gaps spelled out in the query.
    pub max_gaps_to_qualify: usize,
    /// Gap count above which `data_id >= first start` is selected instead.
    pub gaps_to_use_greater_query: usize,
    /// Consumer wait per row.
    pub take_timeout: Duration,
}

impl ReaderSettings {
    /// Settings for `channel` under `config`.
    pub fn for_channel(config: &RouteConfig, channel: &ChannelPolicy) -> Self {
        Self {
            window: config.peek_ahead_window.max(1),
            group_transactions: channel.batch_algorithm.groups_transactions(),
            max_data_to_route: channel.max_data_to_route,
            max_gaps_to_qualify: config.max_gaps_to_qualify_in_sql.max(1),
            gaps_to_use_greater_query: config.gaps_to_use_greater_query,
            take_timeout: config.wait_for_data_timeout(),
        }
    }
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self::for_channel(&RouteConfig::default(), &ChannelPolicy::default())
    }
}

/// Change-log query restricted to the gaps.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadQuery {
    /// SQL text with positional parameters.
    pub sql: String,
    /// Parameters: channel id, then gap bounds.
    pub params: Vec<Value>,
    /// True when selecting `data_id >= first gap start`.
    pub greater_than: bool,
}

/// Build the reader query. At most `max_gaps_to_qualify` ranges are spelled
/// out; when there are more gaps the last range is stretched to the end of
/// the final gap, and in-memory validation drops rows between gaps. Above
/// `gaps_to_use_greater_query` gaps (0 disables the switch) a single
/// `data_id >=` bound is used instead.
pub fn build_read_query(
    channel_id: &str,
    gaps: &[DataGap],
    max_gaps_to_qualify: usize,
    gaps_to_use_greater_query: usize,
) -> ReadQuery {
    let mut params = vec![Value::Text(channel_id.to_string())];
    let base = format!("SELECT {CHANGE_COLUMNS} FROM change_log WHERE channel_id = ?");
    let first_start = gaps.first().map(|g| g.start_id).unwrap_or(0);

    if gaps.is_empty() || (gaps_to_use_greater_query > 0 && gaps.len() > gaps_to_use_greater_query) {
        params.push(Value::BigInt(first_start));
        return ReadQuery {
            sql: format!("{base} AND data_id >= ? ORDER BY data_id"),
            params,
            greater_than: true,
        };
    }

    let qualified = max_gaps_to_qualify.max(1).min(gaps.len());
    let mut ranges = Vec::with_capacity(qualified);
    for (i, gap) in gaps.iter().take(qualified).enumerate() {
        let end = if i + 1 == qualified && qualified < gaps.len() {
            gaps[gaps.len() - 1].end_id
        } else {
            gap.end_id
        };
        params.push(Value::BigInt(gap.start_id));
        params.push(Value::BigInt(end));
        ranges.push("(data_id BETWEEN ? AND ?)");
    }
    ReadQuery {
        sql: format!("{base} AND ({}) ORDER BY data_id", ranges.join(" OR ")),
        params,
        greater_than: false,
    }
}

/// Gap validation plus transactional peek-ahead over a [`DataCursor`].
pub struct PeekAheadReader<C> {
    cursor: C,
    gaps: GapCursor,
    settings: ReaderSettings,
    buffer: VecDeque<ChangeRecord>,
    cursor_done: bool,
    stats: ReaderStats,
}

impl<C: DataCursor> PeekAheadReader<C> {
    /// Reader over `cursor`, validated against `gaps` (ordered by start id).
    pub fn new(cursor: C, gaps: Vec<DataGap>, settings: ReaderSettings) -> Self {
        Self {
            cursor,
            gaps: GapCursor::new(gaps),
            buffer: VecDeque::with_capacity(settings.window),
            settings,
            cursor_done: false,
            stats: ReaderStats::default(),
        }
    }

    fn fill(&mut self) -> RouteResult<()> {
        let mut started = Instant::now();
        while !self.cursor_done && self.buffer.len() < self.settings.window {
            let Some(record) = self.cursor.next_record()? else {
                self.cursor_done = true;
                break;
            };
            let elapsed = started.elapsed().as_millis() as u64;
            if self.gaps.admit(record.data_id) {
                self.stats.data_read += 1;
                self.stats.read_data_ms += elapsed;
                self.buffer.push_back(record);
            } else {
                debug!(data_id = record.data_id, "skipping row outside the known gaps");
                self.stats.data_reread += 1;
                self.stats.reread_data_ms += elapsed;
            }
            started = Instant::now();
        }
        Ok(())
    }

    /// Run to completion, passing each row to `emit`. `emit` returns false
    /// when the consumer is gone, which stops the reader early.
    pub fn run(mut self, mut emit: impl FnMut(ChangeRecord) -> bool) -> RouteResult<ReaderStats> {
        let mut emitted = 0usize;
        let mut last_transaction: Option<String> = None;

        'read: while emitted <= self.settings.max_data_to_route || last_transaction.is_some() {
            self.fill()?;

            let grouping = self.settings.group_transactions && last_transaction.is_some();
            if !grouping {
                let Some(record) = self.buffer.pop_front() else {
                    break;
                };
                if self.settings.group_transactions {
                    last_transaction = record.transaction_id.clone();
                }
                if !self.emit(&mut emit, record) {
                    break;
                }
                emitted += 1;
                continue;
            }

            if self.buffer.is_empty() {
                break;
            }
            let current = last_transaction.clone();
            let mut matched = 0usize;
            let mut index = 0;
            while index < self.buffer.len() {
                if self.buffer[index].transaction_id == current {
                    if let Some(record) = self.buffer.remove(index) {
                        matched += 1;
                        if !self.emit(&mut emit, record) {
                            break 'read;
                        }
                        emitted += 1;
                    }
                } else {
                    index += 1;
                }
            }
            if matched == 0 {
                last_transaction = None;
            }
        }

        self.stats.data_corrupt = self.cursor.corrupt_rows();
        Ok(self.stats)
    }

    fn emit(&mut self, emit: &mut impl FnMut(ChangeRecord) -> bool, record: ChangeRecord) -> bool {
        let started = Instant::now();
        let delivered = emit(record);
        self.stats.enqueue_data_ms += started.elapsed().as_millis() as u64;
        if delivered {
            self.stats.data_emitted += 1;
        }
        delivered
    }
}

/// Run `reader` to completion and collect what it emits.
pub fn read_all<C: DataCursor>(reader: PeekAheadReader<C>) -> RouteResult<(Vec<ChangeRecord>, ReaderStats)> {
    let mut rows = Vec::new();
    let stats = reader.run(|record| {
        rows.push(record);
        true
    })?;
    Ok((rows, stats))
}

/// Consumer side of a running reader.
#[derive(Debug)]
pub struct ReaderHandle {
    channel_id: String,
    rx: mpsc::Receiver<ReadEvent>,
    join: JoinHandle<RouteResult<ReaderStats>>,
    take_timeout: Duration,
    finished: bool,
}

impl ReaderHandle {
    /// Next row, or `None` once the reader posted end of data. Fails when no
    /// row arrives within the take timeout.
    pub async fn take(&mut self) -> RouteResult<Option<ChangeRecord>> {
        if self.finished {
            return Ok(None);
        }
        match tokio::time::timeout(self.take_timeout, self.rx.recv()).await {
            Ok(Some(ReadEvent::Data(record))) => Ok(Some(record)),
            Ok(Some(ReadEvent::EndOfData)) | Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Err(_) => Err(RouteError::ReaderTimeout {
                channel_id: self.channel_id.clone(),
                waited_secs: self.take_timeout.as_secs(),
            }),
        }
    }

    /// Stop consuming and wait for the reader's result. Dropping the queue
    /// first unblocks a reader still waiting for room.
    pub async fn finish(self) -> RouteResult<ReaderStats> {
        let Self {
            channel_id, rx, join, ..
        } = self;
        drop(rx);
        match join.await {
            Ok(result) => result,
            Err(e) => Err(RouteError::ReaderAborted {
                channel_id,
                msg: e.to_string(),
            }),
        }
    }
}

fn spawn_with<F>(channel_id: &str, settings: &ReaderSettings, body: F) -> ReaderHandle
where
    F: FnOnce(&mpsc::Sender<ReadEvent>) -> RouteResult<ReaderStats> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(settings.window.max(1));
    let reader_channel = channel_id.to_string();
    let join = tokio::task::spawn_blocking(move || {
        let result = body(&tx);
        // Posted on every exit path; fails only if the consumer is gone.
        let _ = tx.blocking_send(ReadEvent::EndOfData);
        match &result {
            Ok(stats) => debug!(channel_id = %reader_channel, ?stats, "reader finished"),
            Err(e) => warn!(channel_id = %reader_channel, error = %e, "reader failed"),
        }
        result
    });
    ReaderHandle {
        channel_id: channel_id.to_string(),
        rx,
        join,
        take_timeout: settings.take_timeout,
        finished: false,
    }
}

fn sender_emit(tx: &mpsc::Sender<ReadEvent>) -> impl FnMut(ChangeRecord) -> bool + '_ {
    move |record| tx.blocking_send(ReadEvent::Data(record)).is_ok()
}

/// Run a reader over `cursor` on a blocking thread.
pub fn spawn_cursor_reader<C>(channel_id: &str, cursor: C, gaps: Vec<DataGap>, settings: ReaderSettings) -> ReaderHandle
where
    C: DataCursor + Send + 'static,
{
    let reader_settings = settings.clone();
    spawn_with(channel_id, &settings, move |tx| {
        PeekAheadReader::new(cursor, gaps, reader_settings).run(sender_emit(tx))
    })
}

/// Run a reader over the change log for `channel_id` on a blocking thread.
pub fn spawn_reader(
    db: &Database,
    channel_id: &str,
    gaps: Vec<DataGap>,
    settings: ReaderSettings,
) -> RouteResult<ReaderHandle> {
    if gaps.is_empty() {
        debug!(channel_id, "no gaps to read");
        return Ok(spawn_cursor_reader(channel_id, VecCursor::new(Vec::new()), gaps, settings));
    }
    let conn = db.reader_connection()?;
    let query = build_read_query(
        channel_id,
        &gaps,
        settings.max_gaps_to_qualify,
        settings.gaps_to_use_greater_query,
    );
    if query.greater_than {
        info!(channel_id, gaps = gaps.len(), "selecting from the change log where data_id >= first gap start");
    }
    let reader_settings = settings.clone();
    Ok(spawn_with(channel_id, &settings, move |tx| {
        let greater_than = query.greater_than;
        let mut stmt = conn.prepare(&query.sql)?;
        let rows = stmt.query(params_from_iter(query.params))?;
        let mut stats =
            PeekAheadReader::new(RowsCursor::new(rows), gaps, reader_settings).run(sender_emit(tx))?;
        stats.used_greater_query = greater_than;
        Ok(stats)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, OPEN_END_ID};

    fn row(id: i64, tx: Option<&str>) -> ChangeRecord {
        let record = ChangeRecord::new(id, "t", EventType::Insert, "default");
        match tx {
            Some(tx) => record.with_transaction(tx),
            None => record,
        }
    }

    fn settings(window: usize, group: bool, max: usize) -> ReaderSettings {
        ReaderSettings {
            window,
            group_transactions: group,
            max_data_to_route: max,
            max_gaps_to_qualify: 100,
            gaps_to_use_greater_query: 100,
            take_timeout: Duration::from_secs(5),
        }
    }

    fn ids(rows: &[ChangeRecord]) -> Vec<i64> {
        rows.iter().map(|r| r.data_id).collect()
    }

    fn run(rows: Vec<ChangeRecord>, gaps: Vec<DataGap>, settings: ReaderSettings) -> (Vec<i64>, ReaderStats) {
        let (out, stats) = read_all(PeekAheadReader::new(VecCursor::new(rows), gaps, settings)).unwrap();
        (ids(&out), stats)
    }

    #[test]
    fn test_gap_cursor_skips_between_gaps() {
        let mut cursor = GapCursor::new(vec![DataGap::new(100, 150, 0), DataGap::new(500, 520, 0)]);
        assert!(!cursor.admit(99));
        assert!(cursor.admit(101));
        assert!(!cursor.admit(151));
        assert!(cursor.admit(500));
        assert!(cursor.admit(520));
        assert!(!cursor.admit(521));
        assert!(!cursor.admit(1_000));
    }

    #[test]
    fn test_example_scenario() {
        let rows = vec![
            row(101, None),
            row(102, Some("T1")),
            row(103, Some("T1")),
            row(151, Some("T1")),
            row(501, None),
            row(502, None),
        ];
        let gaps = vec![DataGap::new(100, 150, 0), DataGap::new(500, 520, 0)];
        let (out, stats) = run(rows, gaps, settings(1000, true, 100_000));
        assert_eq!(out, vec![101, 102, 103, 501, 502]);
        assert_eq!(stats.data_reread, 1);
        assert_eq!(stats.data_emitted, 5);
    }

    #[test]
    fn test_small_window_groups_across_refills() {
        let rows = vec![
            row(1, Some("T1")),
            row(2, Some("T1")),
            row(3, Some("T2")),
            row(4, Some("T1")),
            row(5, Some("T2")),
        ];
        let gaps = vec![DataGap::new(0, 3, 0), DataGap::new(4, OPEN_END_ID, 0)];
        let (out, _) = run(rows, gaps, settings(2, true, 100_000));
        assert_eq!(out, vec![1, 2, 4, 3, 5]);
    }

    #[test]
    fn test_nontransactional_keeps_id_order() {
        let rows = vec![
            row(1, Some("T1")),
            row(2, Some("T2")),
            row(3, Some("T1")),
        ];
        let (out, _) = run(rows, vec![DataGap::new(0, OPEN_END_ID, 0)], settings(10, false, 100_000));
        assert_eq!(out, vec![1, 2, 3]);
    }

    fn capped_rows() -> Vec<ChangeRecord> {
        vec![
            row(1, Some("T1")),
            row(2, Some("T1")),
            row(3, Some("T2")),
            row(4, Some("T2")),
            row(5, Some("T1")),
            row(6, Some("T1")),
        ]
    }

    #[test]
    fn test_max_data_to_route_finishes_open_transaction() {
        let gaps = vec![DataGap::new(0, OPEN_END_ID, 0)];
        let (out, _) = run(capped_rows(), gaps, settings(100, true, 3));
        assert_eq!(out, vec![1, 2, 5, 6]);
    }

    #[test]
    fn test_uncapped_groups_whole_transactions() {
        let gaps = vec![DataGap::new(0, OPEN_END_ID, 0)];
        let (out, _) = run(capped_rows(), gaps, settings(100, true, 100));
        assert_eq!(out, vec![1, 2, 5, 6, 3, 4]);
    }

    #[test]
    fn test_consumer_gone_stops_reader() {
        let rows = (1..=10).map(|id| row(id, None)).collect();
        let reader = PeekAheadReader::new(VecCursor::new(rows), vec![DataGap::new(0, OPEN_END_ID, 0)], settings(4, true, 100));
        let mut seen = 0;
        let stats = reader
            .run(|_| {
                seen += 1;
                seen < 3
            })
            .unwrap();
        assert_eq!(seen, 3);
        assert_eq!(stats.data_emitted, 2);
    }

    #[test]
    fn test_build_query_qualifies_gaps() {
        let gaps = vec![
            DataGap::new(1, 5, 0),
            DataGap::new(10, 20, 0),
            DataGap::new(30, 40, 0),
            DataGap::new(50, OPEN_END_ID, 0),
        ];
        let query = build_read_query("default", &gaps, 2, 100);
        assert!(!query.greater_than);
        assert_eq!(query.sql.matches("BETWEEN").count(), 2);
        assert_eq!(
            query.params,
            vec![
                Value::Text("default".to_string()),
                Value::BigInt(1),
                Value::BigInt(5),
                Value::BigInt(10),
                Value::BigInt(OPEN_END_ID),
            ]
        );
    }

    #[test]
    fn test_build_query_switches_to_greater_than() {
        let gaps: Vec<DataGap> = (0..5).map(|i| DataGap::new(i * 10, i * 10 + 5, 0)).collect();
        let query = build_read_query("default", &gaps, 100, 3);
        assert!(query.greater_than);
        assert!(query.sql.contains("data_id >= ?"));
        assert_eq!(query.params[1], Value::BigInt(0));

        let query = build_read_query("default", &gaps, 100, 0);
        assert!(!query.greater_than);
    }

    #[tokio::test]
    async fn test_spawned_reader_posts_end_of_data() {
        let rows: Vec<ChangeRecord> = (1..=50).map(|id| row(id, None)).collect();
        let mut handle = spawn_cursor_reader(
            "default",
            VecCursor::new(rows),
            vec![DataGap::new(0, OPEN_END_ID, 0)],
            settings(4, true, 100_000),
        );
        let mut out = Vec::new();
        while let Some(record) = handle.take().await.unwrap() {
            out.push(record.data_id);
        }
        assert_eq!(out, (1..=50).collect::<Vec<_>>());
        assert!(handle.take().await.unwrap().is_none());
        let stats = handle.finish().await.unwrap();
        assert_eq!(stats.data_emitted, 50);
    }

    struct FailingCursor {
        remaining: usize,
    }

    impl DataCursor for FailingCursor {
        fn next_record(&mut self) -> RouteResult<Option<ChangeRecord>> {
            if self.remaining == 0 {
                return Err(RouteError::Config {
                    msg: "cursor failed".to_string(),
                });
            }
            self.remaining -= 1;
            Ok(Some(row(10 - self.remaining as i64, None)))
        }
    }

    #[tokio::test]
    async fn test_reader_error_reaches_consumer() {
        let mut handle = spawn_cursor_reader(
            "default",
            FailingCursor { remaining: 3 },
            vec![DataGap::new(0, OPEN_END_ID, 0)],
            settings(1, true, 100_000),
        );
        let mut count = 0;
        while handle.take().await.unwrap().is_some() {
            count += 1;
        }
        assert!(count <= 3);
        assert!(handle.finish().await.is_err());
    }

    #[tokio::test]
    async fn test_finish_unblocks_full_queue() {
        let rows: Vec<ChangeRecord> = (1..=100).map(|id| row(id, None)).collect();
        let mut handle = spawn_cursor_reader(
            "default",
            VecCursor::new(rows),
            vec![DataGap::new(0, OPEN_END_ID, 0)],
            settings(2, true, 100_000),
        );
        assert_eq!(handle.take().await.unwrap().map(|r| r.data_id), Some(1));
        let stats = handle.finish().await.unwrap();
        assert!(stats.data_emitted < 100);
    }

    #[tokio::test]
    async fn test_database_reader() {
        let db = Database::open_in_memory().unwrap();
        for id in [101, 102, 103, 151, 501, 502] {
            let mut record = row(id, if (102..=151).contains(&id) { Some("T1") } else { None });
            if id == 502 {
                record.channel_id = "other".to_string();
            }
            db.insert_change(&record).unwrap();
        }
        let gaps = vec![DataGap::new(100, 150, 0), DataGap::new(500, 520, 0)];
        let mut handle = spawn_reader(&db, "default", gaps, settings(10, true, 100_000)).unwrap();
        let mut out = Vec::new();
        while let Some(record) = handle.take().await.unwrap() {
            out.push(record.data_id);
        }
        let stats = handle.finish().await.unwrap();
        assert_eq!(out, vec![101, 102, 103, 501]);
        assert!(!stats.used_greater_query);
    }

    #[tokio::test]
    async fn test_no_gaps_ends_without_querying() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch("DROP TABLE change_log")?;
            Ok(())
        })
        .unwrap();
        let mut handle = spawn_reader(&db, "default", Vec::new(), settings(10, true, 100_000)).unwrap();
        assert!(handle.take().await.unwrap().is_none());
        let stats = handle.finish().await.unwrap();
        assert!(!stats.used_greater_query);
    }
}
