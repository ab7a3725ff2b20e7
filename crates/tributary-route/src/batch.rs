//! Outgoing batches and their CSV payload.
//!
//! A batch collects the rows routed to one node on one channel. Its payload is
//! written straight into a staged resource:
//!
//! ```text
//! nodeid,000
//! channel,default
//! batch,17
//! table,orders
//! keys,id
//! columns,id,status
//! insert,1,open
//! old,1,open
//! update,1,shipped,1
//! commit,17
//! ```
//!
//! The `table`/`keys`/`columns` banner is written once per trigger history
//! per batch.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;
use tracing::debug;
use tributary_stage::{StageWriter, StagingManager};

use crate::error::{RouteError, RouteResult};
use crate::model::{ChangeRecord, EventType, TriggerHistory};

/// Node id of the batch that collects rows routed to nobody.
pub const UNROUTED_NODE_ID: &str = "-1";

/// Delivery status of an outgoing batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BatchStatus {
    /// Waiting to be extracted and sent.
    New,
    /// Nothing left to do.
    Ok,
}

impl BatchStatus {
    /// Two-letter code stored with the batch.
    pub fn code(&self) -> &'static str {
        match self {
            Self::New => "NE",
            Self::Ok => "OK",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Bookkeeping of one outgoing batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingBatch {
    /// Batch identity.
    pub batch_id: i64,
    /// Target node.
    pub node_id: String,
    /// Channel the rows came from.
    pub channel_id: String,
    /// Delivery status.
    pub status: BatchStatus,
    /// Rows in the batch.
    pub data_event_count: usize,
    /// Event counts by type.
    pub event_counts: BTreeMap<EventType, usize>,
    /// Ids of the rows in the batch.
    pub data_ids: Vec<i64>,
    /// When the batch was opened (ms since epoch).
    pub create_time_ms: i64,
}

impl OutgoingBatch {
    /// An empty batch.
    pub fn new(batch_id: i64, node_id: &str, channel_id: &str, now_ms: i64) -> Self {
        let status = if node_id == UNROUTED_NODE_ID {
            BatchStatus::Ok
        } else {
            BatchStatus::New
        };
        Self {
            batch_id,
            node_id: node_id.to_string(),
            channel_id: channel_id.to_string(),
            status,
            data_event_count: 0,
            event_counts: BTreeMap::new(),
            data_ids: Vec::new(),
            create_time_ms: now_ms,
        }
    }

    /// Returns true for the batch of rows routed to nobody.
    pub fn is_unrouted(&self) -> bool {
        self.node_id == UNROUTED_NODE_ID
    }

    fn count(&mut self, record: &ChangeRecord) {
        self.data_event_count += 1;
        *self.event_counts.entry(record.event_type).or_insert(0) += 1;
        self.data_ids.push(record.data_id);
    }
}

/// Staged resource path of a batch payload.
pub fn staged_path(node_id: &str, batch_id: i64) -> String {
    format!("outgoing/{node_id}/{batch_id}")
}

/// Parse one CSV line of column values.
fn parse_values(payload: &str) -> Result<Vec<String>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(payload.as_bytes());
    let mut record = csv::StringRecord::new();
    match reader.read_record(&mut record) {
        Ok(true) => Ok(record.iter().map(str::to_string).collect()),
        Ok(false) => Ok(Vec::new()),
        Err(e) => Err(format!("unparseable payload: {e}")),
    }
}

fn require<'a>(data: &'a Option<String>, what: &str, event: EventType) -> Result<&'a str, String> {
    data.as_deref()
        .ok_or_else(|| format!("{event} row has no {what}"))
}

fn values_with_arity(payload: &str, expected: &[String], what: &str) -> Result<Vec<String>, String> {
    let values = parse_values(payload)?;
    if values.len() != expected.len() {
        return Err(format!(
            "{what} has {} values, trigger history expects {}",
            values.len(),
            expected.len()
        ));
    }
    Ok(values)
}

fn line(keyword: &str, values: Vec<String>) -> Vec<String> {
    let mut line = Vec::with_capacity(values.len() + 1);
    line.push(keyword.to_string());
    line.extend(values);
    line
}

/// Payload lines of one change row, validated against its trigger history.
/// An `Err` carries the reason the row is corrupt.
pub fn payload_lines(record: &ChangeRecord, history: Option<&TriggerHistory>) -> Result<Vec<Vec<String>>, String> {
    let hist = history.ok_or_else(|| format!("no trigger history {}", record.trigger_hist_id))?;
    let event = record.event_type;
    let mut lines = Vec::new();
    match event {
        EventType::Insert => {
            let row = require(&record.row_data, "row data", event)?;
            lines.push(line("insert", values_with_arity(row, &hist.column_names, "row data")?));
        }
        EventType::Update => {
            let row = require(&record.row_data, "row data", event)?;
            let pk = require(&record.pk_data, "pk data", event)?;
            if let Some(old) = &record.old_data {
                lines.push(line("old", values_with_arity(old, &hist.column_names, "old data")?));
            }
            let mut values = values_with_arity(row, &hist.column_names, "row data")?;
            values.extend(values_with_arity(pk, &hist.pk_column_names, "pk data")?);
            lines.push(line("update", values));
        }
        EventType::Delete => {
            let pk = require(&record.pk_data, "pk data", event)?;
            if let Some(old) = &record.old_data {
                lines.push(line("old", values_with_arity(old, &hist.column_names, "old data")?));
            }
            lines.push(line("delete", values_with_arity(pk, &hist.pk_column_names, "pk data")?));
        }
        EventType::Reload => {
            let pk = require(&record.pk_data, "pk data", event)?;
            lines.push(line("reload", values_with_arity(pk, &hist.pk_column_names, "pk data")?));
        }
        EventType::Sql | EventType::Create => {
            let row = require(&record.row_data, "row data", event)?;
            let values = parse_values(row)?;
            if values.len() != 1 {
                return Err(format!("{event} row must hold exactly one value"));
            }
            lines.push(line(event.keyword(), values));
        }
    }
    Ok(lines)
}

/// CSV writer for one batch payload, backed by a staged resource.
pub struct BatchPayloadWriter {
    csv: csv::Writer<StageWriter>,
    batch_id: i64,
    written_histories: HashSet<i64>,
}

impl BatchPayloadWriter {
    /// Open the staged resource for the batch and write the header lines.
    pub fn create(
        staging: &StagingManager,
        source_node_id: &str,
        batch: &OutgoingBatch,
    ) -> RouteResult<Self> {
        let stage = staging.create(&staged_path(&batch.node_id, batch.batch_id))?;
        let mut csv = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(stage);
        let batch_id = batch.batch_id.to_string();
        csv.write_record(["nodeid", source_node_id])?;
        csv.write_record(["channel", batch.channel_id.as_str()])?;
        csv.write_record(["batch", batch_id.as_str()])?;
        Ok(Self {
            csv,
            batch_id: batch.batch_id,
            written_histories: HashSet::new(),
        })
    }

    /// Append the lines of one row, preceded by its schema banner the first
    /// time its trigger history appears in this batch.
    pub fn write_row(&mut self, history: &TriggerHistory, lines: &[Vec<String>]) -> RouteResult<()> {
        if self.written_histories.insert(history.trigger_hist_id) {
            self.csv.write_record(["table", history.source_table_name.as_str()])?;
            self.csv
                .write_record(std::iter::once("keys").chain(history.pk_column_names.iter().map(String::as_str)))?;
            self.csv
                .write_record(std::iter::once("columns").chain(history.column_names.iter().map(String::as_str)))?;
        }
        for line in lines {
            self.csv.write_record(line)?;
        }
        Ok(())
    }

    /// Write the trailer and publish the staged resource. Returns the payload size.
    pub fn finish(mut self) -> RouteResult<u64> {
        let batch_id = self.batch_id.to_string();
        self.csv.write_record(["commit", batch_id.as_str()])?;
        let stage = self
            .csv
            .into_inner()
            .map_err(|e| RouteError::Io(e.into_error()))?;
        Ok(stage.finish()?)
    }
}

impl fmt::Debug for BatchPayloadWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchPayloadWriter")
            .field("batch_id", &self.batch_id)
            .field("histories", &self.written_histories.len())
            .finish()
    }
}

/// A batch being filled during a routing run.
#[derive(Debug)]
pub struct OpenBatch {
    batch: OutgoingBatch,
    payload: Option<BatchPayloadWriter>,
}

impl OpenBatch {
    /// Open a batch. Batches for real nodes get a staged payload; the
    /// unrouted batch only counts rows.
    pub fn open(
        staging: &StagingManager,
        source_node_id: &str,
        batch: OutgoingBatch,
    ) -> RouteResult<Self> {
        let payload = if batch.is_unrouted() {
            None
        } else {
            Some(BatchPayloadWriter::create(staging, source_node_id, &batch)?)
        };
        debug!(batch_id = batch.batch_id, node_id = %batch.node_id, channel_id = %batch.channel_id, "opened batch");
        Ok(Self { batch, payload })
    }

    /// Batch bookkeeping.
    pub fn batch(&self) -> &OutgoingBatch {
        &self.batch
    }

    /// Rows added so far.
    pub fn rows(&self) -> usize {
        self.batch.data_event_count
    }

    /// Add one validated row.
    pub fn append(&mut self, record: &ChangeRecord, history: &TriggerHistory, lines: &[Vec<String>]) -> RouteResult<()> {
        if let Some(payload) = self.payload.as_mut() {
            payload.write_row(history, lines)?;
        }
        self.batch.count(record);
        Ok(())
    }

    /// Publish the payload and hand back the closed batch.
    pub fn close(self) -> RouteResult<ClosedBatch> {
        let (staged_path, payload_bytes) = match self.payload {
            Some(payload) => {
                let bytes = payload.finish()?;
                (Some(staged_path(&self.batch.node_id, self.batch.batch_id)), bytes)
            }
            None => (None, 0),
        };
        Ok(ClosedBatch {
            batch: self.batch,
            staged_path,
            payload_bytes,
        })
    }

    /// Drop the partial payload and its staged resource.
    pub fn abandon(self, staging: &StagingManager) {
        let path = staged_path(&self.batch.node_id, self.batch.batch_id);
        let had_payload = self.payload.is_some();
        drop(self.payload);
        if had_payload {
            if let Err(e) = staging.delete(&path) {
                tracing::warn!(path = %path, error = %e, "failed to delete abandoned batch payload");
            }
        }
        debug!(batch_id = self.batch.batch_id, node_id = %self.batch.node_id, "abandoned batch");
    }
}

/// A finished batch handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosedBatch {
    /// Batch bookkeeping.
    pub batch: OutgoingBatch,
    /// Staged resource holding the payload; `None` for the unrouted batch.
    pub staged_path: Option<String>,
    /// Payload size.
    pub payload_bytes: u64,
}

impl ClosedBatch {
    /// Batch identity.
    pub fn batch_id(&self) -> i64 {
        self.batch.batch_id
    }

    /// Target node.
    pub fn node_id(&self) -> &str {
        &self.batch.node_id
    }

    /// Channel.
    pub fn channel_id(&self) -> &str {
        &self.batch.channel_id
    }

    /// Rows in the batch.
    pub fn row_count(&self) -> usize {
        self.batch.data_event_count
    }
}
