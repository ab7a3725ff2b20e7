//! Error types for the routing subsystem.

use thiserror::Error;
use tributary_stage::StageError;

/// Result type alias for routing operations.
pub type RouteResult<T> = Result<T, RouteError>;

/// Errors that can occur while reading, routing and batching change rows.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Query or update against the change, gap or lock tables failed.
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    /// Batch payload staging failed.
    #[error("staging error: {0}")]
    Stage(#[from] StageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload encoding error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The reader did not hand over a row in time.
    #[error("the read of the data to route queue for channel {channel_id} timed out after {waited_secs}s")]
    ReaderTimeout {
        /// Channel being routed.
        channel_id: String,
        /// Seconds waited.
        waited_secs: u64,
    },

    /// The reader task died without reporting a result.
    #[error("reader for channel {channel_id} aborted: {msg}")]
    ReaderAborted {
        /// Channel being routed.
        channel_id: String,
        /// Join failure description.
        msg: String,
    },

    /// No policy is configured for the channel.
    #[error("channel not found: {channel_id}")]
    ChannelNotFound {
        /// The unknown channel identifier.
        channel_id: String,
    },

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the problem.
        msg: String,
    },

    /// The downstream batch sink refused a closed batch.
    #[error("batch {batch_id} rejected: {msg}")]
    BatchRejected {
        /// Rejected batch.
        batch_id: i64,
        /// Reason given by the sink.
        msg: String,
    },
}

impl RouteError {
    /// Returns true for errors the next scheduled run may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RouteError::Database(_) | RouteError::ReaderTimeout { .. } | RouteError::Io(_)
        )
    }
}
