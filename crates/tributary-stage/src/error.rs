//! Error types for the staging subsystem.

use thiserror::Error;

use crate::state::StageState;

/// Result type alias for staging operations.
pub type StageResult<T> = Result<T, StageError>;

/// Errors that can occur while staging batch payloads.
#[derive(Debug, Error)]
pub enum StageError {
    /// Wraps standard I/O errors (disk full, permissions, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No resource is registered under the path.
    #[error("staged resource not found: {path}")]
    NotFound {
        /// Logical path of the resource.
        path: String,
    },

    /// The resource has open handles that prevent the operation.
    #[error("staged resource {path} is in use by {handles} handle(s)")]
    InUse {
        /// Logical path of the resource.
        path: String,
        /// Number of open handles.
        handles: usize,
    },

    /// The resource was never written.
    #[error("there is no content to read for {path}")]
    NoContent {
        /// Logical path of the resource.
        path: String,
    },

    /// The resource is not in a state that allows the operation.
    #[error("staged resource {path} is {state}, expected {expected}")]
    InvalidState {
        /// Logical path of the resource.
        path: String,
        /// Current state.
        state: StageState,
        /// State required by the operation.
        expected: StageState,
    },

    /// The logical path is empty, absolute or escapes the staging directory.
    #[error("invalid staging path: {path}")]
    InvalidPath {
        /// The rejected path.
        path: String,
    },
}
