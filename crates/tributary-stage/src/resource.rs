//! A single staged resource: logical path, lifecycle state, and the payload
//! held either in memory or in a backing file.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::current_time_ms;
use crate::error::{StageError, StageResult};
use crate::state::StageState;

/// Identity of an open reader or writer handle.
pub type HandleId = u64;

/// What an open handle is doing with the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Reading the finished payload.
    Reader,
    /// Accumulating the payload.
    Writer,
}

/// Where the payload currently lives. Memory and file are mutually exclusive.
#[derive(Debug, Clone)]
pub(crate) enum Content {
    Empty,
    Memory(Bytes),
    File,
}

/// Source a reader pulls bytes from, opened while the resource was locked.
pub(crate) enum ReadSource {
    Memory(Cursor<Bytes>),
    File(BufReader<File>),
}

#[derive(Debug)]
struct ResourceInner {
    state: StageState,
    content: Content,
    size: u64,
    last_update_ms: i64,
    handles: HashMap<HandleId, HandleKind>,
}

/// A size-adaptive payload container identified by a logical path.
#[derive(Debug)]
pub struct StagedResource {
    path: String,
    directory: PathBuf,
    inner: Mutex<ResourceInner>,
}

impl StagedResource {
    /// A fresh resource about to be written.
    pub(crate) fn new(directory: &Path, path: &str) -> Self {
        Self {
            path: path.to_string(),
            directory: directory.to_path_buf(),
            inner: Mutex::new(ResourceInner {
                state: StageState::Creating,
                content: Content::Empty,
                size: 0,
                last_update_ms: current_time_ms(),
                handles: HashMap::new(),
            }),
        }
    }

    /// A resource rediscovered on disk at startup.
    pub(crate) fn from_file(
        directory: &Path,
        path: &str,
        state: StageState,
        size: u64,
        last_update_ms: i64,
    ) -> Self {
        Self {
            path: path.to_string(),
            directory: directory.to_path_buf(),
            inner: Mutex::new(ResourceInner {
                state,
                content: Content::File,
                size,
                last_update_ms,
                handles: HashMap::new(),
            }),
        }
    }

    /// Logical path (identity) of the resource.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StageState {
        self.inner.lock().state
    }

    /// Payload size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Time of the last state or content change (ms since epoch).
    pub fn last_update_ms(&self) -> i64 {
        self.inner.lock().last_update_ms
    }

    /// Returns true when the payload lives in a backing file.
    pub fn is_file_resource(&self) -> bool {
        matches!(self.inner.lock().content, Content::File)
    }

    /// Returns true while any reader or writer handle is open.
    pub fn is_in_use(&self) -> bool {
        !self.inner.lock().handles.is_empty()
    }

    /// Number of open handles of the given kind.
    pub fn open_handles(&self, kind: HandleKind) -> usize {
        self.inner
            .lock()
            .handles
            .values()
            .filter(|k| **k == kind)
            .count()
    }

    /// Backing file path for the current state.
    pub fn file_path(&self) -> PathBuf {
        let state = self.inner.lock().state;
        self.build_file(state)
    }

    pub(crate) fn build_file(&self, state: StageState) -> PathBuf {
        self.directory
            .join(format!("{}.{}", self.path, state.extension()))
    }

    /// Take the writer slot and discard any previous content.
    pub(crate) fn begin_write(&self, handle: HandleId) -> StageResult<()> {
        let mut inner = self.inner.lock();
        if !inner.handles.is_empty() {
            return Err(StageError::InUse {
                path: self.path.clone(),
                handles: inner.handles.len(),
            });
        }
        match inner.content {
            Content::File => {
                let file = self.build_file(inner.state);
                warn!(path = %self.path, file = %file.display(), "rewriting staged resource, deleting previous file");
                remove_if_exists(&file)?;
            }
            Content::Memory(_) => {
                warn!(path = %self.path, "rewriting staged resource, discarding previous memory buffer");
            }
            Content::Empty => {}
        }
        inner.content = Content::Empty;
        inner.state = StageState::Creating;
        inner.size = 0;
        inner.last_update_ms = current_time_ms();
        inner.handles.insert(handle, HandleKind::Writer);
        Ok(())
    }

    /// Register a reader and open its byte source while the state is stable.
    pub(crate) fn begin_read(&self, handle: HandleId) -> StageResult<ReadSource> {
        let mut inner = self.inner.lock();
        if !inner.state.is_readable() {
            return Err(StageError::InvalidState {
                path: self.path.clone(),
                state: inner.state,
                expected: StageState::Ready,
            });
        }
        let source = match &inner.content {
            Content::Memory(bytes) => ReadSource::Memory(Cursor::new(bytes.clone())),
            Content::File => {
                let file = File::open(self.build_file(inner.state))?;
                ReadSource::File(BufReader::new(file))
            }
            Content::Empty => {
                return Err(StageError::NoContent {
                    path: self.path.clone(),
                })
            }
        };
        inner.handles.insert(handle, HandleKind::Reader);
        Ok(source)
    }

    /// Drop one handle; other handles on the resource are unaffected.
    pub(crate) fn release_handle(&self, handle: HandleId) -> bool {
        let released = self.inner.lock().handles.remove(&handle).is_some();
        if released {
            debug!(path = %self.path, handle, "released staging handle");
        }
        released
    }

    /// Finish a write whose payload stayed under the threshold.
    pub(crate) fn publish_memory(&self, payload: Bytes) {
        let mut inner = self.inner.lock();
        inner.size = payload.len() as u64;
        inner.content = Content::Memory(payload);
        inner.state = StageState::Ready;
        inner.last_update_ms = current_time_ms();
    }

    /// Finish a write that spilled to disk: rename `.create` to `.ready`.
    pub(crate) fn publish_file(&self, size: u64) -> StageResult<()> {
        let mut inner = self.inner.lock();
        let from = self.build_file(StageState::Creating);
        let to = self.build_file(StageState::Ready);
        remove_if_exists(&to)?;
        fs::rename(&from, &to)?;
        inner.size = size;
        inner.content = Content::File;
        inner.state = StageState::Ready;
        inner.last_update_ms = current_time_ms();
        Ok(())
    }

    /// Throw away a partial write.
    pub(crate) fn abandon(&self) {
        let mut inner = self.inner.lock();
        let partial = self.build_file(StageState::Creating);
        if let Err(e) = remove_if_exists(&partial) {
            warn!(path = %self.path, error = %e, "failed to remove abandoned staging file");
        }
        inner.content = Content::Empty;
        inner.size = 0;
        inner.last_update_ms = current_time_ms();
    }

    /// Move the resource to a new state, renaming its backing file if any.
    pub fn set_state(&self, state: StageState) -> StageResult<()> {
        let mut inner = self.inner.lock();
        if inner.state == state {
            return Ok(());
        }
        if matches!(inner.content, Content::File) {
            let from = self.build_file(inner.state);
            let to = self.build_file(state);
            remove_if_exists(&to)?;
            fs::rename(&from, &to)?;
        }
        debug!(path = %self.path, from = %inner.state, to = %state, "staged resource state change");
        inner.state = state;
        inner.last_update_ms = current_time_ms();
        Ok(())
    }

    /// Remove the payload from memory and disk. Refuses while handles are open.
    pub(crate) fn delete_content(&self) -> StageResult<bool> {
        let mut inner = self.inner.lock();
        if !inner.handles.is_empty() {
            return Err(StageError::InUse {
                path: self.path.clone(),
                handles: inner.handles.len(),
            });
        }
        let deleted = match inner.content {
            Content::File => remove_if_exists(&self.build_file(inner.state))?,
            Content::Memory(_) => true,
            Content::Empty => remove_if_exists(&self.build_file(StageState::Creating))?,
        };
        inner.content = Content::Empty;
        inner.size = 0;
        Ok(deleted)
    }
}

/// Remove a file, treating "already gone" as success. Returns whether a file was removed.
pub(crate) fn remove_if_exists(file: &Path) -> StageResult<bool> {
    match fs::remove_file(file) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
