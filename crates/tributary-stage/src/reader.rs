//! Read handle for a finished staged resource.

use std::io::{self, BufRead, Read};
use std::sync::Arc;

use crate::resource::{HandleId, ReadSource, StagedResource};

/// Read handle for a staged resource.
///
/// Each reader has its own position; several readers may be open on the same
/// resource at once. Dropping or closing the reader releases only this handle.
pub struct StageReader {
    resource: Arc<StagedResource>,
    handle: HandleId,
    source: ReadSource,
}

impl StageReader {
    pub(crate) fn new(resource: Arc<StagedResource>, handle: HandleId, source: ReadSource) -> Self {
        Self {
            resource,
            handle,
            source,
        }
    }

    /// Identity of this handle.
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// Logical path of the resource being read.
    pub fn path(&self) -> &str {
        self.resource.path()
    }

    /// Returns true when reading from the backing file.
    pub fn is_file_backed(&self) -> bool {
        matches!(self.source, ReadSource::File(_))
    }

    /// Read the remaining payload into a byte vector.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Release the handle.
    pub fn close(self) {
        drop(self);
    }
}

impl Read for StageReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            ReadSource::Memory(cursor) => cursor.read(buf),
            ReadSource::File(file) => file.read(buf),
        }
    }
}

impl BufRead for StageReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match &mut self.source {
            ReadSource::Memory(cursor) => cursor.fill_buf(),
            ReadSource::File(file) => file.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match &mut self.source {
            ReadSource::Memory(cursor) => cursor.consume(amt),
            ReadSource::File(file) => file.consume(amt),
        }
    }
}

impl Drop for StageReader {
    fn drop(&mut self) {
        self.resource.release_handle(self.handle);
    }
}

impl std::fmt::Debug for StageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageReader")
            .field("path", &self.resource.path())
            .field("handle", &self.handle)
            .field("file_backed", &self.is_file_backed())
            .finish()
    }
}
