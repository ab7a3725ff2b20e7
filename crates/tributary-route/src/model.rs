//! Change-log rows, gaps, trigger histories and channel policies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::batch_algorithm::BatchAlgorithm;

/// End id of the open tail gap.
pub const OPEN_END_ID: i64 = i64::MAX;

/// Kind of captured change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
    /// Row queued for a full reload on the target.
    Reload,
    /// Free-form SQL to run on the target.
    Sql,
    /// Table creation.
    Create,
}

impl EventType {
    /// Single-letter code stored in the change log.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
            Self::Reload => "R",
            Self::Sql => "S",
            Self::Create => "C",
        }
    }

    /// Payload line keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Reload => "reload",
            Self::Sql => "sql",
            Self::Create => "create",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code {
            "I" => Ok(Self::Insert),
            "U" => Ok(Self::Update),
            "D" => Ok(Self::Delete),
            "R" => Ok(Self::Reload),
            "S" => Ok(Self::Sql),
            "C" => Ok(Self::Create),
            other => Err(format!("unknown event type code: {other}")),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// One captured row change. Created by the capture triggers, read-only here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Log id, unique and increasing in allocation (not commit) order.
    pub data_id: i64,
    /// Source table.
    pub table_name: String,
    /// Kind of change.
    pub event_type: EventType,
    /// New column values as one CSV line.
    pub row_data: Option<String>,
    /// Primary key values as one CSV line.
    pub pk_data: Option<String>,
    /// Previous column values as one CSV line.
    pub old_data: Option<String>,
    /// Replication channel.
    pub channel_id: String,
    /// Source transaction; `None` means the row is its own group.
    pub transaction_id: Option<String>,
    /// Schema version used to interpret the payloads.
    pub trigger_hist_id: i64,
    /// Node the change was received from, if it was not captured locally.
    pub source_node_id: Option<String>,
    /// Capture time (ms since epoch).
    pub create_time_ms: i64,
}

impl ChangeRecord {
    /// A record with no payloads and no transaction.
    pub fn new(data_id: i64, table_name: &str, event_type: EventType, channel_id: &str) -> Self {
        Self {
            data_id,
            table_name: table_name.to_string(),
            event_type,
            row_data: None,
            pk_data: None,
            old_data: None,
            channel_id: channel_id.to_string(),
            transaction_id: None,
            trigger_hist_id: 0,
            source_node_id: None,
            create_time_ms: 0,
        }
    }

    /// Set the source transaction.
    pub fn with_transaction(mut self, transaction_id: &str) -> Self {
        self.transaction_id = Some(transaction_id.to_string());
        self
    }

    /// Set the new row values.
    pub fn with_row_data(mut self, row_data: &str) -> Self {
        self.row_data = Some(row_data.to_string());
        self
    }

    /// Set the primary key values.
    pub fn with_pk_data(mut self, pk_data: &str) -> Self {
        self.pk_data = Some(pk_data.to_string());
        self
    }

    /// Set the previous row values.
    pub fn with_old_data(mut self, old_data: &str) -> Self {
        self.old_data = Some(old_data.to_string());
        self
    }

    /// Set the trigger history reference.
    pub fn with_trigger_hist(mut self, trigger_hist_id: i64) -> Self {
        self.trigger_hist_id = trigger_hist_id;
        self
    }

    /// Mark the record as received from another node.
    pub fn with_source_node(mut self, node_id: &str) -> Self {
        self.source_node_id = Some(node_id.to_string());
        self
    }

    /// Set the capture time.
    pub fn with_create_time(mut self, create_time_ms: i64) -> Self {
        self.create_time_ms = create_time_ms;
        self
    }
}

/// Inclusive range of log ids not yet confirmed as routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataGap {
    /// First id of the range.
    pub start_id: i64,
    /// Last id of the range; [`OPEN_END_ID`] for the open tail.
    pub end_id: i64,
    /// When the gap was recorded (ms since epoch).
    pub create_time_ms: i64,
    /// When the gap was last touched (ms since epoch).
    pub last_update_time_ms: i64,
}

impl DataGap {
    /// A gap created at `now_ms`.
    pub fn new(start_id: i64, end_id: i64, now_ms: i64) -> Self {
        Self {
            start_id,
            end_id,
            create_time_ms: now_ms,
            last_update_time_ms: now_ms,
        }
    }

    /// Returns true if `data_id` lies in the range.
    pub fn contains(&self, data_id: i64) -> bool {
        data_id >= self.start_id && data_id <= self.end_id
    }

    /// Number of ids covered.
    pub fn size(&self) -> u64 {
        (self.end_id as i128 - self.start_id as i128 + 1).max(0) as u64
    }

    /// Returns true for the open tail gap.
    pub fn is_open_ended(&self) -> bool {
        self.end_id == OPEN_END_ID
    }
}

impl fmt::Display for DataGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open_ended() {
            write!(f, "[{}, ..)", self.start_id)
        } else {
            write!(f, "[{}, {}]", self.start_id, self.end_id)
        }
    }
}

/// Schema version of a captured table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerHistory {
    /// Identity referenced by [`ChangeRecord::trigger_hist_id`].
    pub trigger_hist_id: i64,
    /// Captured table.
    pub source_table_name: String,
    /// All captured columns, in payload order.
    pub column_names: Vec<String>,
    /// Primary key columns, in payload order.
    pub pk_column_names: Vec<String>,
}

impl TriggerHistory {
    /// Build a history from column name slices.
    pub fn new(trigger_hist_id: i64, table: &str, columns: &[&str], pk_columns: &[&str]) -> Self {
        Self {
            trigger_hist_id,
            source_table_name: table.to_string(),
            column_names: columns.iter().map(|c| c.to_string()).collect(),
            pk_column_names: pk_columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Batching policy of one replication channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPolicy {
    /// Channel identity.
    pub channel_id: String,
    /// Row count at which a batch may close.
    pub max_batch_size: usize,
    /// How batch boundaries relate to transactions.
    pub batch_algorithm: BatchAlgorithm,
    /// Row cap per routing run; the open transaction is always finished.
    pub max_data_to_route: usize,
    /// Disabled channels are skipped by the router.
    pub enabled: bool,
}

impl ChannelPolicy {
    /// A transactional channel with default limits.
    pub fn new(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            ..Self::default()
        }
    }

    /// Override the batch size.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Override the batch algorithm.
    pub fn with_algorithm(mut self, batch_algorithm: BatchAlgorithm) -> Self {
        self.batch_algorithm = batch_algorithm;
        self
    }

    /// Override the per-run row cap.
    pub fn with_max_data_to_route(mut self, max_data_to_route: usize) -> Self {
        self.max_data_to_route = max_data_to_route;
        self
    }
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            channel_id: "default".to_string(),
            max_batch_size: 1000,
            batch_algorithm: BatchAlgorithm::Transactional,
            max_data_to_route: 100_000,
            enabled: true,
        }
    }
}
