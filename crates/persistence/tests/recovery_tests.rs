use event_buffer::store::{
    BufferStore, BufferedEvent, EventBufferStore, PositionStore, ProcessedEvent,
    ProcessedEventStore, StreamPosition,
};
use event_buffer::StreamKey;
use event_buffer_persistence::log::{EntryHeader, LogHeader, LogReader};
use event_buffer_persistence::{DurableStore, PersistenceError, StoreOptions, LOG_FILE};
use std::fs;
use std::path::Path;
use tempfile::tempdir;
use uuid::Uuid;

fn fast() -> StoreOptions {
    StoreOptions {
        sync_on_append: false,
        ..StoreOptions::default()
    }
}

fn key() -> StreamKey {
    StreamKey::new(Uuid::nil(), "ctx", "EVENT_LISTENER")
}

/// Ten position upserts, one entry each.
fn write_positions(dir: &Path) {
    let store = DurableStore::open(dir, fast()).unwrap();
    for v in 1..=10 {
        store.upsert(&StreamPosition::new(key(), v)).unwrap();
    }
}

fn entry_ends(log: &Path) -> Vec<u64> {
    let mut reader = LogReader::open(log).unwrap();
    let mut ends = Vec::new();
    while let Some(entry) = reader.next() {
        entry.unwrap();
        ends.push(reader.offset());
    }
    ends
}

#[test]
fn test_recover_truncated_tail() {
    let dir = tempdir().unwrap();
    write_positions(dir.path());
    let log = dir.path().join(LOG_FILE);

    let full = fs::metadata(&log).unwrap().len();
    fs::OpenOptions::new()
        .write(true)
        .open(&log)
        .unwrap()
        .set_len(full - 1)
        .unwrap();

    let store = DurableStore::open(dir.path(), fast()).unwrap();
    assert_eq!(store.recovery().replayed, 9);
    assert!(store.recovery().truncated_bytes > 0);
    assert_eq!(store.get(&key()).unwrap().unwrap().version, 9);

    // The torn bytes are gone, so new entries land on a clean boundary.
    store.upsert(&StreamPosition::new(key(), 42)).unwrap();
    drop(store);
    let store = DurableStore::open(dir.path(), fast()).unwrap();
    assert_eq!(store.recovery().truncated_bytes, 0);
    assert_eq!(store.get(&key()).unwrap().unwrap().version, 42);
}

#[test]
fn test_fail_on_corrupted_middle() {
    let dir = tempdir().unwrap();
    write_positions(dir.path());
    let log = dir.path().join(LOG_FILE);

    let ends = entry_ends(&log);
    // First payload byte of the sixth entry.
    let target = (ends[4] + EntryHeader::SIZE as u64) as usize;
    let mut data = fs::read(&log).unwrap();
    data[target] = !data[target];
    fs::write(&log, &data).unwrap();

    match DurableStore::open(dir.path(), fast()) {
        Err(PersistenceError::ChecksumMismatch { offset, .. }) => assert_eq!(offset, ends[4]),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("opening a corrupted log must fail"),
    }
}

#[test]
fn test_corrupted_length_in_middle_fails_closed() {
    let dir = tempdir().unwrap();
    write_positions(dir.path());
    let log = dir.path().join(LOG_FILE);
    let before = fs::read(&log).unwrap();

    let ends = entry_ends(&log);
    // Length field of the third entry, pointed far past the end of the file.
    let target = ends[1] as usize;
    let mut data = before.clone();
    data[target..target + 4].copy_from_slice(&1_000_000u32.to_le_bytes());
    fs::write(&log, &data).unwrap();

    match DurableStore::open(dir.path(), fast()) {
        Err(PersistenceError::CorruptFrame { offset, .. }) => assert_eq!(offset, ends[1]),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("a corrupted length must not be taken for a torn tail"),
    }
    // Nothing was cut.
    assert_eq!(fs::read(&log).unwrap().len(), before.len());
}

#[test]
fn test_fuzz_every_truncation_point() {
    let dir = tempdir().unwrap();
    write_positions(dir.path());
    let log = dir.path().join(LOG_FILE);
    let ends = entry_ends(&log);
    let data = fs::read(&log).unwrap();

    for size in LogHeader::SIZE as u64..=data.len() as u64 {
        let case = tempdir().unwrap();
        fs::write(case.path().join(LOG_FILE), &data[..size as usize]).unwrap();

        let store = DurableStore::open(case.path(), fast())
            .unwrap_or_else(|e| panic!("size {}: {}", size, e));
        let complete = ends.iter().filter(|end| **end <= size).count() as i64;

        assert_eq!(store.recovery().replayed, complete as u64, "size {}", size);
        let position = store.get(&key()).unwrap().map(|p| p.version);
        let expected = if complete == 0 { None } else { Some(complete) };
        assert_eq!(position, expected, "size {}", size);
    }
}

#[test]
fn test_release_survives_restart_as_one_unit() {
    let dir = tempdir().unwrap();
    {
        let store = DurableStore::open(dir.path(), fast()).unwrap();
        store.upsert(&StreamPosition::new(key(), 1)).unwrap();
        store.insert(BufferedEvent::new(key(), 2, "{\"v\":2}")).unwrap();
        store.insert(BufferedEvent::new(key(), 3, "{\"v\":3}")).unwrap();
        store
            .release(
                &StreamPosition::new(key(), 2),
                &BufferedEvent::new(key(), 2, "{\"v\":2}"),
            )
            .unwrap();
    }

    let store = DurableStore::open(dir.path(), fast()).unwrap();
    assert_eq!(store.get(&key()).unwrap().unwrap().version, 2);
    let rows: Vec<_> = store
        .find_by_stream_ascending(&key())
        .unwrap()
        .map(|r| r.unwrap().version)
        .collect();
    assert_eq!(rows, vec![3]);
}

#[test]
fn test_compaction_keeps_live_rows_only() {
    let dir = tempdir().unwrap();
    let store = DurableStore::open(dir.path(), fast()).unwrap();

    for v in 1..=20 {
        store.upsert(&StreamPosition::new(key(), v)).unwrap();
    }
    store.insert(BufferedEvent::new(key(), 25, "{}")).unwrap();
    store.insert(BufferedEvent::new(key(), 30, "{}")).unwrap();
    store.remove(&BufferedEvent::new(key(), 25, "{}")).unwrap();
    store
        .save(&ProcessedEvent {
            previous_event_number: 0,
            event_number: 7,
            source: "ctx".to_string(),
            component: "EVENT_LISTENER".to_string(),
        })
        .unwrap();

    let stats = store.compact().unwrap();
    assert_eq!(stats.entries_before, 24);
    assert_eq!(stats.entries_after, 3);
    assert!(!dir.path().join("buffer.log.tmp").exists());

    // Writes after compaction append to the new file.
    store.upsert(&StreamPosition::new(key(), 21)).unwrap();
    drop(store);

    let store = DurableStore::open(dir.path(), fast()).unwrap();
    assert_eq!(store.recovery().replayed, 4);
    assert_eq!(store.get(&key()).unwrap().unwrap().version, 21);
    assert_eq!(store.state().buffered_len(), 1);
    assert_eq!(
        store.latest("ctx", "EVENT_LISTENER").unwrap().unwrap().event_number,
        7
    );
}

#[test]
fn test_foreign_file_is_rejected() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join(LOG_FILE), b"not a store log at all").unwrap();

    assert!(matches!(
        DurableStore::open(dir.path(), fast()),
        Err(PersistenceError::InvalidMagic)
    ));
}
