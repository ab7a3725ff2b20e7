//! DuckDB access: schema, shared connection and row mapping for the change log.

use std::collections::HashMap;
use std::sync::Arc;

use duckdb::{params, Connection, Row};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::RouteResult;
use crate::model::{ChangeRecord, EventType, TriggerHistory};

/// Columns selected for a change record, in [`map_change_row`] order.
pub const CHANGE_COLUMNS: &str = "data_id, table_name, event_type, row_data, pk_data, old_data, \
     channel_id, transaction_id, trigger_hist_id, source_node_id, create_time";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS change_log (
    data_id BIGINT PRIMARY KEY,
    table_name VARCHAR NOT NULL,
    event_type VARCHAR NOT NULL,
    row_data VARCHAR,
    pk_data VARCHAR,
    old_data VARCHAR,
    channel_id VARCHAR NOT NULL,
    transaction_id VARCHAR,
    trigger_hist_id BIGINT NOT NULL,
    source_node_id VARCHAR,
    create_time BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS data_gap (
    start_id BIGINT NOT NULL,
    end_id BIGINT NOT NULL,
    create_time BIGINT NOT NULL,
    last_update_time BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS cluster_lock (
    lock_id VARCHAR NOT NULL,
    lock_action VARCHAR NOT NULL,
    locking_server_id VARCHAR,
    lock_time BIGINT,
    last_locking_server_id VARCHAR,
    last_lock_time BIGINT,
    PRIMARY KEY (lock_id, lock_action)
);
CREATE TABLE IF NOT EXISTS trigger_hist (
    trigger_hist_id BIGINT PRIMARY KEY,
    source_table_name VARCHAR NOT NULL,
    column_names VARCHAR NOT NULL,
    pk_column_names VARCHAR NOT NULL
);
CREATE TABLE IF NOT EXISTS outgoing_batch (
    batch_id BIGINT PRIMARY KEY,
    node_id VARCHAR NOT NULL,
    channel_id VARCHAR NOT NULL,
    status VARCHAR NOT NULL,
    data_event_count BIGINT NOT NULL,
    staged_path VARCHAR,
    create_time BIGINT NOT NULL
);
CREATE SEQUENCE IF NOT EXISTS batch_id_seq START 1;
"#;

/// Shared handle to the replication database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

impl Database {
    /// Open a database file, or an in-memory database for `:memory:`.
    pub fn open(path: &str) -> RouteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        debug!(path, "opened database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_string(),
        })
    }

    /// Open a private in-memory database with the schema installed.
    pub fn open_in_memory() -> RouteResult<Self> {
        let db = Self::open(":memory:")?;
        db.install_schema()?;
        Ok(db)
    }

    /// Database location as configured.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create the tables and sequences if they do not exist.
    pub fn install_schema(&self) -> RouteResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
    }

    /// Run `f` with exclusive use of the shared connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> RouteResult<T>) -> RouteResult<T> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    /// A separate connection to the same database for a reader thread.
    pub fn reader_connection(&self) -> RouteResult<Connection> {
        Ok(self.conn.lock().try_clone()?)
    }

    /// A handle with its own connection to the same database, so its
    /// statements run in separate transactions from this handle's.
    pub fn connect(&self) -> RouteResult<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(self.reader_connection()?)),
            path: self.path.clone(),
        })
    }

    /// Allocate the next outgoing batch id.
    pub fn next_batch_id(&self) -> RouteResult<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT nextval('batch_id_seq')", [], |row| row.get(0))?)
        })
    }

    /// Append a row to the change log.
    pub fn insert_change(&self, record: &ChangeRecord) -> RouteResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO change_log (data_id, table_name, event_type, row_data, pk_data, old_data, \
                 channel_id, transaction_id, trigger_hist_id, source_node_id, create_time) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    record.data_id,
                    record.table_name,
                    record.event_type.code(),
                    record.row_data,
                    record.pk_data,
                    record.old_data,
                    record.channel_id,
                    record.transaction_id,
                    record.trigger_hist_id,
                    record.source_node_id,
                    record.create_time_ms,
                ],
            )?;
            Ok(())
        })
    }

    /// Register a trigger history, replacing one with the same id.
    pub fn insert_trigger_history(&self, hist: &TriggerHistory) -> RouteResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM trigger_hist WHERE trigger_hist_id = ?",
                params![hist.trigger_hist_id],
            )?;
            conn.execute(
                "INSERT INTO trigger_hist (trigger_hist_id, source_table_name, column_names, pk_column_names) \
                 VALUES (?, ?, ?, ?)",
                params![
                    hist.trigger_hist_id,
                    hist.source_table_name,
                    hist.column_names.join(","),
                    hist.pk_column_names.join(","),
                ],
            )?;
            Ok(())
        })
    }

    /// All trigger histories keyed by id.
    pub fn trigger_histories(&self) -> RouteResult<HashMap<i64, TriggerHistory>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT trigger_hist_id, source_table_name, column_names, pk_column_names FROM trigger_hist",
            )?;
            let mut rows = stmt.query([])?;
            let mut histories = HashMap::new();
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let columns: String = row.get(2)?;
                let pk_columns: String = row.get(3)?;
                histories.insert(
                    id,
                    TriggerHistory {
                        trigger_hist_id: id,
                        source_table_name: row.get(1)?,
                        column_names: split_names(&columns),
                        pk_column_names: split_names(&pk_columns),
                    },
                );
            }
            Ok(histories)
        })
    }

    /// Rows of a channel with an id above `after_id`.
    pub fn count_unrouted(&self, channel_id: &str, after_id: i64) -> RouteResult<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT count(*) FROM change_log WHERE channel_id = ? AND data_id > ?",
                params![channel_id, after_id],
                |row| row.get(0),
            )?)
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

fn split_names(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Map a row selected with [`CHANGE_COLUMNS`]. Returns the raw code as the
/// error when the event type is not recognised.
pub fn map_change_row(row: &Row<'_>) -> duckdb::Result<Result<ChangeRecord, (i64, String)>> {
    let data_id: i64 = row.get(0)?;
    let code: String = row.get(2)?;
    let event_type = match code.parse::<EventType>() {
        Ok(event_type) => event_type,
        Err(_) => return Ok(Err((data_id, code))),
    };
    Ok(Ok(ChangeRecord {
        data_id,
        table_name: row.get(1)?,
        event_type,
        row_data: row.get(3)?,
        pk_data: row.get(4)?,
        old_data: row.get(5)?,
        channel_id: row.get(6)?,
        transaction_id: row.get(7)?,
        trigger_hist_id: row.get(8)?,
        source_node_id: row.get(9)?,
        create_time_ms: row.get(10)?,
    }))
}
