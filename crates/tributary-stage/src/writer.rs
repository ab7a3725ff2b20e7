//! Threshold writer: buffers in memory, spills to the backing file once the
//! payload would grow past the threshold.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::StageResult;
use crate::resource::{remove_if_exists, HandleId, StagedResource};
use crate::state::StageState;

/// Write handle for a staged resource.
///
/// Callers see a plain [`Write`]; whether the bytes end up in memory or in a
/// file is decided by the threshold. Call [`StageWriter::finish`] to publish
/// the payload. Dropping an unfinished writer abandons the partial payload.
pub struct StageWriter {
    resource: Arc<StagedResource>,
    handle: HandleId,
    threshold_bytes: u64,
    buffer: Vec<u8>,
    file: Option<BufWriter<File>>,
    written: u64,
    finished: bool,
}

impl StageWriter {
    pub(crate) fn new(resource: Arc<StagedResource>, handle: HandleId, threshold_bytes: u64) -> Self {
        Self {
            resource,
            handle,
            threshold_bytes,
            buffer: Vec::new(),
            file: None,
            written: 0,
            finished: false,
        }
    }

    /// Identity of this handle.
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// Logical path of the resource being written.
    pub fn path(&self) -> &str {
        self.resource.path()
    }

    /// The resource being written.
    pub fn resource(&self) -> &Arc<StagedResource> {
        &self.resource
    }

    /// Bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Returns true once the payload has moved to the backing file.
    pub fn is_spilled(&self) -> bool {
        self.file.is_some()
    }

    fn spill(&mut self) -> io::Result<()> {
        let target = self.resource.build_file(StageState::Creating);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.exists() {
            warn!(file = %target.display(), "staging file already existed, replacing it");
        }
        let mut file = BufWriter::new(File::create(&target)?);
        file.write_all(&self.buffer)?;
        debug!(
            path = %self.resource.path(),
            buffered = self.buffer.len(),
            threshold = self.threshold_bytes,
            "staged resource spilled to disk"
        );
        self.buffer = Vec::new();
        self.file = Some(file);
        Ok(())
    }

    /// Publish the payload and move the resource to [`StageState::Ready`].
    /// Returns the payload size.
    pub fn finish(mut self) -> StageResult<u64> {
        self.finished = true;
        let size = self.written;
        let result = match self.file.take() {
            Some(mut file) => match file.flush() {
                Ok(()) => {
                    drop(file);
                    self.resource.publish_file(size)
                }
                Err(e) => Err(e.into()),
            },
            None => {
                let payload = Bytes::from(std::mem::take(&mut self.buffer));
                self.resource.publish_memory(payload);
                Ok(())
            }
        };
        if result.is_err() {
            self.resource.abandon();
        }
        self.resource.release_handle(self.handle);
        result.map(|_| size)
    }

    /// Abandon the partial payload and release the handle.
    pub fn close(self) {
        drop(self);
    }
}

impl Write for StageWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.file.is_none()
            && self.buffer.len() as u64 + buf.len() as u64 > self.threshold_bytes
        {
            self.spill()?;
        }
        match self.file.as_mut() {
            Some(file) => file.write_all(buf)?,
            None => self.buffer.extend_from_slice(buf),
        }
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for StageWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!(path = %self.resource.path(), "abandoning unfinished staged resource");
        if let Some(file) = self.file.take() {
            drop(file);
            if let Err(e) = remove_if_exists(&self.resource.build_file(StageState::Creating)) {
                warn!(path = %self.resource.path(), error = %e, "failed to remove partial staging file");
            }
        }
        self.resource.abandon();
        self.resource.release_handle(self.handle);
    }
}

impl std::fmt::Debug for StageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageWriter")
            .field("path", &self.resource.path())
            .field("handle", &self.handle)
            .field("written", &self.written)
            .field("spilled", &self.file.is_some())
            .finish()
    }
}
