//! Staging manager: registry of staged resources under one directory.
//!
//! The manager hands out explicit [`StageWriter`] / [`StageReader`] handles,
//! tracks which handles are open on each resource, and deletes resources once
//! nobody holds them and the purge policy allows it.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::{StageError, StageResult};
use crate::reader::StageReader;
use crate::resource::{remove_if_exists, StagedResource};
use crate::state::StageState;
use crate::writer::StageWriter;

/// Registry of staged resources rooted at one directory.
#[derive(Debug)]
pub struct StagingManager {
    directory: PathBuf,
    threshold_bytes: u64,
    ttl_ms: i64,
    resources: DashMap<String, Arc<StagedResource>>,
    next_handle: AtomicU64,
}

impl StagingManager {
    /// Create a manager rooted at `directory`, registering the finished
    /// resources already on disk and removing abandoned partial files.
    pub fn new(directory: impl Into<PathBuf>, threshold_bytes: u64, ttl_ms: i64) -> StageResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        let manager = Self {
            directory,
            threshold_bytes,
            ttl_ms,
            resources: DashMap::new(),
            next_handle: AtomicU64::new(1),
        };
        manager.scan()?;
        Ok(manager)
    }

    /// Root directory of the backing files.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Payload size above which resources spill to disk.
    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_bytes
    }

    fn scan(&self) -> StageResult<()> {
        let mut pending = vec![self.directory.clone()];
        let mut found = 0usize;
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let file = entry.path();
                if entry.file_type()?.is_dir() {
                    pending.push(file);
                    continue;
                }
                let Some(state) = file
                    .extension()
                    .and_then(|e| e.to_str())
                    .and_then(StageState::from_extension)
                else {
                    continue;
                };
                if state == StageState::Creating {
                    warn!(file = %file.display(), "removing abandoned staging file");
                    remove_if_exists(&file)?;
                    continue;
                }
                let Some(path) = self.logical_path(&file) else {
                    continue;
                };
                let metadata = entry.metadata()?;
                let modified = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                let resource =
                    StagedResource::from_file(&self.directory, &path, state, metadata.len(), modified);
                self.resources.insert(path, Arc::new(resource));
                found += 1;
            }
        }
        if found > 0 {
            info!(directory = %self.directory.display(), resources = found, "registered existing staged resources");
        }
        Ok(())
    }

    fn logical_path(&self, file: &Path) -> Option<String> {
        let relative = file.strip_prefix(&self.directory).ok()?.with_extension("");
        let parts: Vec<&str> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    fn validate(path: &str) -> StageResult<()> {
        let bad = path.is_empty()
            || path.starts_with('/')
            || path.split('/').any(|p| p.is_empty() || p == "." || p == "..");
        if bad {
            return Err(StageError::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    fn allocate_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a write handle on `path`, creating the resource if needed.
    pub fn create(&self, path: &str) -> StageResult<StageWriter> {
        Self::validate(path)?;
        let resource = self
            .resources
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(StagedResource::new(&self.directory, path)))
            .clone();
        let handle = self.allocate_handle();
        resource.begin_write(handle)?;
        debug!(path, handle, "opened staging writer");
        Ok(StageWriter::new(resource, handle, self.threshold_bytes))
    }

    /// Open a read handle on a finished resource.
    pub fn open_read(&self, path: &str) -> StageResult<StageReader> {
        let resource = self.find(path).ok_or_else(|| StageError::NotFound {
            path: path.to_string(),
        })?;
        let handle = self.allocate_handle();
        let source = resource.begin_read(handle)?;
        debug!(path, handle, "opened staging reader");
        Ok(StageReader::new(resource, handle, source))
    }

    /// Look up a resource by path.
    pub fn find(&self, path: &str) -> Option<Arc<StagedResource>> {
        self.resources.get(path).map(|r| r.value().clone())
    }

    /// Paths of every registered resource, sorted.
    pub fn resource_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.resources.iter().map(|r| r.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Mark a finished resource as consumed by every target.
    pub fn mark_consumed(&self, path: &str) -> StageResult<()> {
        let resource = self.find(path).ok_or_else(|| StageError::NotFound {
            path: path.to_string(),
        })?;
        let state = resource.state();
        if !state.is_readable() {
            return Err(StageError::InvalidState {
                path: path.to_string(),
                state,
                expected: StageState::Ready,
            });
        }
        resource.set_state(StageState::Consumed)
    }

    /// Delete a resource. Idempotent: deleting an unknown path returns
    /// `Ok(false)`. Fails with [`StageError::InUse`] while handles are open.
    pub fn delete(&self, path: &str) -> StageResult<bool> {
        let Some(resource) = self.find(path) else {
            return Ok(false);
        };
        resource.delete_content()?;
        self.resources.remove(path);
        debug!(path, "deleted staged resource");
        Ok(true)
    }

    /// Delete every unused resource that is consumed, and every abandoned
    /// write older than the TTL. A ready resource is never purged, however
    /// old: it waits for its consumer. Returns the number of resources removed.
    pub fn purge(&self, now_ms: i64) -> StageResult<usize> {
        let candidates: Vec<String> = self
            .resources
            .iter()
            .filter(|r| {
                let resource = r.value();
                !resource.is_in_use()
                    && match resource.state() {
                        StageState::Consumed => true,
                        StageState::Creating => now_ms - resource.last_update_ms() >= self.ttl_ms,
                        StageState::Ready => false,
                    }
            })
            .map(|r| r.key().clone())
            .collect();

        let mut purged = 0;
        for path in candidates {
            match self.delete(&path) {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(StageError::InUse { .. }) => {
                    debug!(path = %path, "staged resource became busy during purge");
                }
                Err(e) => return Err(e),
            }
        }
        if purged > 0 {
            info!(purged, "purged staged resources");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::current_time_ms;
    use crate::resource::HandleKind;
    use std::io::{Read, Write};
    use tempfile::tempdir;

    fn manager(dir: &Path, threshold: u64) -> StagingManager {
        StagingManager::new(dir, threshold, 60_000).unwrap()
    }

    #[test]
    fn test_small_payload_stays_in_memory() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 64);
        let mut writer = mgr.create("outgoing/001/1").unwrap();
        writer.write_all(b"insert,\"1\"\n").unwrap();
        assert!(!writer.is_spilled());
        writer.finish().unwrap();

        let resource = mgr.find("outgoing/001/1").unwrap();
        assert!(!resource.is_file_resource());
        assert_eq!(resource.state(), StageState::Ready);
        assert!(!dir.path().join("outgoing/001/1.ready").exists());
        assert!(!dir.path().join("outgoing/001/1.create").exists());
    }

    #[test]
    fn test_payload_at_threshold_stays_in_memory() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 8);
        let mut writer = mgr.create("a").unwrap();
        writer.write_all(b"1234").unwrap();
        writer.write_all(b"5678").unwrap();
        assert!(!writer.is_spilled());
        assert_eq!(writer.finish().unwrap(), 8);
        assert!(!mgr.find("a").unwrap().is_file_resource());
    }

    #[test]
    fn test_large_payload_spills_to_file() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 16);
        let mut writer = mgr.create("outgoing/002/5").unwrap();
        writer.write_all(b"0123456789").unwrap();
        assert!(!writer.is_spilled());
        writer.write_all(b"abcdefghij").unwrap();
        assert!(writer.is_spilled());
        assert!(dir.path().join("outgoing/002/5.create").exists());
        assert_eq!(writer.finish().unwrap(), 20);

        assert!(dir.path().join("outgoing/002/5.ready").exists());
        assert!(!dir.path().join("outgoing/002/5.create").exists());
        let mut reader = mgr.open_read("outgoing/002/5").unwrap();
        assert!(reader.is_file_backed());
        assert_eq!(reader.read_all().unwrap(), b"0123456789abcdefghij".to_vec());
    }

    #[test]
    fn test_zero_threshold_always_uses_file() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 0);
        let mut writer = mgr.create("z").unwrap();
        writer.write_all(b"x").unwrap();
        assert!(writer.is_spilled());
        writer.finish().unwrap();
        assert!(mgr.find("z").unwrap().is_file_resource());
    }

    #[test]
    fn test_concurrent_readers_have_independent_positions() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 1024);
        let mut writer = mgr.create("common/1").unwrap();
        writer.write_all(b"hello world").unwrap();
        writer.finish().unwrap();

        let mut first = mgr.open_read("common/1").unwrap();
        let mut second = mgr.open_read("common/1").unwrap();
        let resource = mgr.find("common/1").unwrap();
        assert_eq!(resource.open_handles(HandleKind::Reader), 2);

        let mut head = [0u8; 5];
        first.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"hello");
        assert_eq!(second.read_all().unwrap(), b"hello world".to_vec());

        first.close();
        assert_eq!(resource.open_handles(HandleKind::Reader), 1);
        assert!(resource.is_in_use());
        drop(second);
        assert!(!resource.is_in_use());
    }

    #[test]
    fn test_readers_on_other_threads() {
        let dir = tempdir().unwrap();
        let mgr = Arc::new(manager(dir.path(), 4));
        let mut writer = mgr.create("outgoing/shared").unwrap();
        writer.write_all(b"payload for many nodes").unwrap();
        writer.finish().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mgr = mgr.clone();
                std::thread::spawn(move || {
                    let mut reader = mgr.open_read("outgoing/shared").unwrap();
                    reader.read_all().unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), b"payload for many nodes".to_vec());
        }
        assert!(!mgr.find("outgoing/shared").unwrap().is_in_use());
    }

    #[test]
    fn test_open_read_unknown_path() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 16);
        assert!(matches!(
            mgr.open_read("missing").unwrap_err(),
            StageError::NotFound { .. }
        ));
    }

    #[test]
    fn test_open_read_while_creating() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 16);
        let _writer = mgr.create("busy").unwrap();
        assert!(matches!(
            mgr.open_read("busy").unwrap_err(),
            StageError::InvalidState { .. }
        ));
    }

    #[test]
    fn test_dropped_writer_abandons_partial_file() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 2);
        {
            let mut writer = mgr.create("outgoing/9/9").unwrap();
            writer.write_all(b"more than two").unwrap();
            assert!(dir.path().join("outgoing/9/9.create").exists());
        }
        assert!(!dir.path().join("outgoing/9/9.create").exists());
        let resource = mgr.find("outgoing/9/9").unwrap();
        assert!(!resource.is_in_use());
        assert_eq!(resource.state(), StageState::Creating);
    }

    #[test]
    fn test_mark_consumed_renames_file() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 1);
        let mut writer = mgr.create("b/1").unwrap();
        writer.write_all(b"spilled").unwrap();
        writer.finish().unwrap();
        mgr.mark_consumed("b/1").unwrap();
        assert!(dir.path().join("b/1.done").exists());
        assert!(!dir.path().join("b/1.ready").exists());
        let mut reader = mgr.open_read("b/1").unwrap();
        assert_eq!(reader.read_all().unwrap(), b"spilled".to_vec());
    }

    #[test]
    fn test_mark_consumed_requires_finished_payload() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 16);
        let _writer = mgr.create("c").unwrap();
        assert!(matches!(
            mgr.mark_consumed("c").unwrap_err(),
            StageError::InvalidState { .. }
        ));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 1);
        let mut writer = mgr.create("d/1").unwrap();
        writer.write_all(b"data").unwrap();
        writer.finish().unwrap();

        assert!(mgr.delete("d/1").unwrap());
        assert!(!dir.path().join("d/1.ready").exists());
        assert!(!mgr.delete("d/1").unwrap());
        assert!(mgr.find("d/1").is_none());
    }

    #[test]
    fn test_delete_refused_while_reading() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 1024);
        let mut writer = mgr.create("e").unwrap();
        writer.write_all(b"data").unwrap();
        writer.finish().unwrap();
        let reader = mgr.open_read("e").unwrap();
        assert!(matches!(mgr.delete("e").unwrap_err(), StageError::InUse { .. }));
        drop(reader);
        assert!(mgr.delete("e").unwrap());
    }

    #[test]
    fn test_purge_removes_consumed_and_abandoned_only() {
        let dir = tempdir().unwrap();
        let mgr = StagingManager::new(dir.path(), 1024, 10_000).unwrap();
        for path in ["consumed", "ready", "reading"] {
            let mut writer = mgr.create(path).unwrap();
            writer.write_all(path.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        mgr.mark_consumed("consumed").unwrap();
        mgr.mark_consumed("reading").unwrap();
        let _reader = mgr.open_read("reading").unwrap();
        {
            let mut abandoned = mgr.create("abandoned").unwrap();
            abandoned.write_all(b"partial").unwrap();
        }

        let now = current_time_ms();
        assert_eq!(mgr.purge(now).unwrap(), 1);
        assert_eq!(
            mgr.resource_paths(),
            vec!["abandoned".to_string(), "ready".to_string(), "reading".to_string()]
        );

        assert_eq!(mgr.purge(now + 20_000).unwrap(), 1);
        assert_eq!(mgr.resource_paths(), vec!["ready".to_string(), "reading".to_string()]);
    }

    #[test]
    fn test_purge_keeps_unconsumed_ready_payload() {
        let dir = tempdir().unwrap();
        let mgr = StagingManager::new(dir.path(), 4, 10_000).unwrap();
        let mut writer = mgr.create("outgoing/001/1").unwrap();
        writer.write_all(b"spilled payload").unwrap();
        writer.finish().unwrap();

        assert_eq!(mgr.purge(current_time_ms() + 20_000).unwrap(), 0);
        assert_eq!(mgr.find("outgoing/001/1").unwrap().state(), StageState::Ready);
        let mut reader = mgr.open_read("outgoing/001/1").unwrap();
        assert_eq!(reader.read_all().unwrap(), b"spilled payload".to_vec());
    }

    #[test]
    fn test_new_registers_existing_files() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("outgoing/003")).unwrap();
        fs::write(dir.path().join("outgoing/003/11.ready"), b"ready payload").unwrap();
        fs::write(dir.path().join("outgoing/003/12.done"), b"done").unwrap();
        fs::write(dir.path().join("outgoing/003/13.create"), b"partial").unwrap();

        let mgr = manager(dir.path(), 16);
        assert_eq!(
            mgr.resource_paths(),
            vec!["outgoing/003/11".to_string(), "outgoing/003/12".to_string()]
        );
        assert!(!dir.path().join("outgoing/003/13.create").exists());
        assert_eq!(mgr.find("outgoing/003/12").unwrap().state(), StageState::Consumed);

        let mut reader = mgr.open_read("outgoing/003/11").unwrap();
        assert_eq!(reader.read_all().unwrap(), b"ready payload".to_vec());
    }

    #[test]
    fn test_invalid_paths_rejected() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 16);
        for path in ["", "/abs", "a/../b", "a//b", "./a"] {
            assert!(
                matches!(mgr.create(path).unwrap_err(), StageError::InvalidPath { .. }),
                "path {path:?} accepted"
            );
        }
    }

    #[test]
    fn test_rewrite_replaces_previous_content() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), 4);
        let mut writer = mgr.create("r").unwrap();
        writer.write_all(b"first version").unwrap();
        writer.finish().unwrap();

        let mut writer = mgr.create("r").unwrap();
        writer.write_all(b"2nd").unwrap();
        writer.finish().unwrap();
        assert!(!dir.path().join("r.ready").exists());
        let mut reader = mgr.open_read("r").unwrap();
        assert_eq!(reader.read_all().unwrap(), b"2nd".to_vec());
    }
}
