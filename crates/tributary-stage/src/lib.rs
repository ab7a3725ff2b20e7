#![warn(missing_docs)]

//! Tributary staging subsystem: size-adaptive payload containers for outgoing batches
//!
//! A staged resource starts life as an in-memory buffer and transparently
//! spills to a file once its payload grows past a configured threshold.
//! Readers and writers are explicit handle objects tracked per resource, so a
//! resource can be read concurrently by several extraction tasks while the
//! manager knows exactly when it is safe to delete.

pub mod error;
pub mod manager;
pub mod reader;
pub mod resource;
pub mod state;
pub mod writer;

pub use error::{StageError, StageResult};
pub use manager::StagingManager;
pub use reader::StageReader;
pub use resource::{HandleId, HandleKind, StagedResource};
pub use state::StageState;
pub use writer::StageWriter;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn current_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
