//! Property-based tests for tributary-stage using proptest.
//!
//! These tests check the memory/file threshold behavior of staged resources
//! for arbitrary payloads and write chunkings.

use std::io::Write;

use proptest::prelude::*;
use tempfile::tempdir;
use tributary_stage::{StageState, StagingManager};

/// Payload plus the sizes of the chunks it is written in.
fn payload_and_chunks() -> impl Strategy<Value = (Vec<u8>, Vec<usize>)> {
    proptest::collection::vec(any::<u8>(), 0..4096).prop_flat_map(|data| {
        let len = data.len();
        (
            Just(data),
            proptest::collection::vec(1usize..=512, 0..=(len / 8 + 1)),
        )
    })
}

fn write_chunked(writer: &mut impl Write, data: &[u8], chunks: &[usize]) {
    let mut offset = 0;
    for size in chunks {
        if offset >= data.len() {
            break;
        }
        let end = (offset + size).min(data.len());
        writer.write_all(&data[offset..end]).unwrap();
        offset = end;
    }
    writer.write_all(&data[offset..]).unwrap();
}

proptest! {
    /// A payload never creates a backing file unless it exceeds the threshold,
    /// and reads back byte for byte either way.
    #[test]
    fn test_threshold_decides_backing((data, chunks) in payload_and_chunks(), threshold in 0u64..4096) {
        let dir = tempdir().unwrap();
        let mgr = StagingManager::new(dir.path(), threshold, 60_000).unwrap();

        let mut writer = mgr.create("outgoing/001/1").unwrap();
        write_chunked(&mut writer, &data, &chunks);
        let spilled = writer.is_spilled();
        let size = writer.finish().unwrap();
        prop_assert_eq!(size, data.len() as u64);

        let resource = mgr.find("outgoing/001/1").unwrap();
        prop_assert_eq!(resource.state(), StageState::Ready);
        prop_assert_eq!(spilled, data.len() as u64 > threshold);
        prop_assert_eq!(resource.is_file_resource(), data.len() as u64 > threshold);
        prop_assert_eq!(
            dir.path().join("outgoing/001/1.ready").exists(),
            data.len() as u64 > threshold
        );

        let mut reader = mgr.open_read("outgoing/001/1").unwrap();
        prop_assert_eq!(reader.read_all().unwrap(), data);
    }

    /// Around the threshold, the file path and the memory path hold the same bytes.
    #[test]
    fn test_boundary_payloads_identical(data in proptest::collection::vec(any::<u8>(), 1..2048)) {
        let dir = tempdir().unwrap();
        let len = data.len() as u64;
        let in_memory = StagingManager::new(dir.path().join("mem"), len, 60_000).unwrap();
        let on_disk = StagingManager::new(dir.path().join("disk"), len - 1, 60_000).unwrap();

        for mgr in [&in_memory, &on_disk] {
            let mut writer = mgr.create("b").unwrap();
            writer.write_all(&data).unwrap();
            writer.finish().unwrap();
        }
        prop_assert!(!in_memory.find("b").unwrap().is_file_resource());
        prop_assert!(on_disk.find("b").unwrap().is_file_resource());

        let from_memory = in_memory.open_read("b").unwrap().read_all().unwrap();
        let from_disk = on_disk.open_read("b").unwrap().read_all().unwrap();
        prop_assert_eq!(&from_memory, &from_disk);
        prop_assert_eq!(from_memory, data);
    }

    /// Readers never block deletion once they are all released.
    #[test]
    fn test_delete_after_all_readers_close(readers in 1usize..8, threshold in 0u64..64) {
        let dir = tempdir().unwrap();
        let mgr = StagingManager::new(dir.path(), threshold, 60_000).unwrap();
        let mut writer = mgr.create("r").unwrap();
        writer.write_all(b"0123456789abcdef0123456789abcdef").unwrap();
        writer.finish().unwrap();

        let open: Vec<_> = (0..readers).map(|_| mgr.open_read("r").unwrap()).collect();
        prop_assert!(mgr.delete("r").is_err());
        drop(open);
        prop_assert!(mgr.delete("r").unwrap());
        prop_assert!(!mgr.delete("r").unwrap());
    }
}
