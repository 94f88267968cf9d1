//! Disk-backed store: a [`MemoryStore`] rebuilt from the mutation log.
//!
//! # Invariants
//! - Commit before apply. A mutation reaches the tables only after its log
//!   entry is written, so the tables never hold state the log cannot rebuild.
//! - Mutations that would change nothing (existing status marker, absent
//!   buffer row) are not logged.
//! - Reads never touch the file.
//! - After a failed append every write returns `Poisoned` until `compact`
//!   rewrites the log from the tables.

use crate::error::{PersistenceError, Result};
use crate::log::{LogReader, LogWriter};
use event_buffer::store::{
    BufferCursor, BufferStore, BufferedEvent, EventBufferStore, MemoryStore, Mutation,
    ParkedEvent, ParkedEventStore, PositionStore, ProcessedEvent, ProcessedEventStore,
    StreamPosition, StreamStatus, StreamStatusStore, DEFAULT_FETCH_SIZE,
};
use event_buffer::StreamKey;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub const LOG_FILE: &str = "buffer.log";
const COMPACT_TMP_FILE: &str = "buffer.log.tmp";

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Buffered rows per cursor page.
    pub fetch_size: usize,
    /// `sync_data` after every append.
    pub sync_on_append: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            fetch_size: DEFAULT_FETCH_SIZE,
            sync_on_append: true,
        }
    }
}

/// What `open` found in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub replayed: u64,
    /// Bytes cut from a torn final entry.
    pub truncated_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionStats {
    pub entries_before: u64,
    pub entries_after: u64,
}

pub struct DurableStore {
    dir: PathBuf,
    state: MemoryStore,
    log: Mutex<LogWriter>,
    entries: Mutex<u64>,
    options: StoreOptions,
    recovery: RecoveryReport,
}

impl DurableStore {
    /// Opens the store in `dir`, creating it if needed, and replays the log.
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE);
        let state = MemoryStore::with_fetch_size(options.fetch_size);

        let (writer, recovery) = if path.exists() {
            let (valid_len, recovery) = replay(&path, &state)?;
            let writer = LogWriter::open_append(&path, valid_len, options.sync_on_append)?;
            (writer, recovery)
        } else {
            info!("Creating new store log at {:?}", path);
            let writer = LogWriter::create(&path, 0, options.sync_on_append)?;
            (writer, RecoveryReport::default())
        };

        info!(
            "Store opened: {} entries replayed, {} positions, {} buffered",
            recovery.replayed,
            state.all_positions().len(),
            state.buffered_len()
        );

        Ok(Self {
            dir,
            state,
            log: Mutex::new(writer),
            entries: Mutex::new(recovery.replayed),
            options,
            recovery,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Live tables, for inspection.
    pub fn state(&self) -> &MemoryStore {
        &self.state
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Entries currently in the log file.
    pub fn log_entries(&self) -> u64 {
        *self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True once an append has failed. Writes are refused until `compact`.
    pub fn is_poisoned(&self) -> bool {
        self.log.lock().map_or(true, |log| log.is_poisoned())
    }

    // A poisoned writer may have died mid-append; refuse further writes.
    fn writer(&self) -> Result<MutexGuard<'_, LogWriter>> {
        self.log.lock().map_err(|_| PersistenceError::Poisoned)
    }

    fn bump_entries(&self, by: u64) {
        *self.entries.lock().unwrap_or_else(|e| e.into_inner()) += by;
    }

    /// Log then apply. Returns whether anything changed.
    fn commit(&self, mutation: Mutation) -> Result<bool> {
        let mut log = self.writer()?;
        if !self.state.check(&mutation)? {
            debug!("Skipping no-op {}", mutation.kind());
            return Ok(false);
        }
        log.append(&mutation)?;
        self.bump_entries(1);
        self.state.apply(&mutation)?;
        Ok(true)
    }

    /// Rewrites the log with only the mutations needed for the live tables.
    /// This also replaces a poisoned writer.
    pub fn compact(&self) -> Result<CompactionStats> {
        let mut log = self.writer()?;
        let entries_before = self.log_entries();
        let live = self.state.mutations();
        let entries_after = live.len() as u64;

        let tmp_path = self.dir.join(COMPACT_TMP_FILE);
        {
            let mut tmp = LogWriter::create(&tmp_path, entries_after, false)?;
            for mutation in &live {
                tmp.append(mutation)?;
            }
            fs::File::open(&tmp_path)?.sync_all()?;
        }
        let path = self.log_path();
        fs::rename(&tmp_path, &path)?;
        sync_dir(&self.dir)?;

        let len = fs::metadata(&path)?.len();
        *log = LogWriter::open_append(&path, len, self.options.sync_on_append)?;
        *self.entries.lock().unwrap_or_else(|e| e.into_inner()) = entries_after;

        info!(
            "Compacted store log: {} -> {} entries",
            entries_before, entries_after
        );
        Ok(CompactionStats {
            entries_before,
            entries_after,
        })
    }
}

// Makes the rename itself durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Rebuilds the tables of the store in `dir` without opening it for writing.
/// The log file is left untouched, torn tail included.
pub fn load_state(dir: impl AsRef<Path>) -> Result<(MemoryStore, RecoveryReport)> {
    let path = dir.as_ref().join(LOG_FILE);
    let state = MemoryStore::new();
    let (_, report) = replay(&path, &state)?;
    Ok((state, report))
}

/// Applies every readable entry to `state`. Returns the length of the valid prefix.
fn replay(path: &Path, state: &MemoryStore) -> Result<(u64, RecoveryReport)> {
    let file_len = fs::metadata(path)?.len();
    let mut reader = LogReader::open(path)?;
    let mut report = RecoveryReport::default();

    while let Some(entry) = reader.next() {
        match entry {
            Ok(entry) => {
                state.apply(&entry.mutation)?;
                report.replayed += 1;
            }
            Err(PersistenceError::Truncated { offset }) => {
                report.truncated_bytes = file_len - offset;
                warn!(
                    "Torn entry at offset {} in {:?}; discarding {} trailing bytes",
                    offset, path, report.truncated_bytes
                );
                return Ok((offset, report));
            }
            Err(e) => return Err(e),
        }
    }

    Ok((reader.offset(), report))
}

impl PositionStore for DurableStore {
    fn get(&self, key: &StreamKey) -> event_buffer::Result<Option<StreamPosition>> {
        self.state.get(key)
    }

    fn upsert(&self, position: &StreamPosition) -> event_buffer::Result<()> {
        self.commit(Mutation::UpsertPosition(position.clone()))?;
        Ok(())
    }
}

impl BufferStore for DurableStore {
    fn insert(&self, event: BufferedEvent) -> event_buffer::Result<()> {
        self.commit(Mutation::InsertBuffered(event))?;
        Ok(())
    }

    fn find_by_stream_ascending<'a>(
        &'a self,
        key: &StreamKey,
    ) -> event_buffer::Result<BufferCursor<'a>> {
        self.state.find_by_stream_ascending(key)
    }

    fn remove(&self, event: &BufferedEvent) -> event_buffer::Result<()> {
        self.commit(Mutation::RemoveBuffered {
            key: event.key.clone(),
            version: event.version,
        })?;
        Ok(())
    }
}

impl StreamStatusStore for DurableStore {
    fn insert_or_do_nothing(&self, status: &StreamStatus) -> event_buffer::Result<bool> {
        Ok(self.commit(Mutation::InsertStatus(status.clone()))?)
    }

    fn find_status(&self, key: &StreamKey) -> event_buffer::Result<Option<StreamStatus>> {
        self.state.find_status(key)
    }
}

impl ProcessedEventStore for DurableStore {
    fn save(&self, item: &ProcessedEvent) -> event_buffer::Result<()> {
        self.commit(Mutation::SaveProcessed(item.clone()))?;
        Ok(())
    }

    fn all_descending(
        &self,
        source: &str,
        component: &str,
    ) -> event_buffer::Result<Vec<ProcessedEvent>> {
        self.state.all_descending(source, component)
    }

    fn latest(&self, source: &str, component: &str) -> event_buffer::Result<Option<ProcessedEvent>> {
        self.state.latest(source, component)
    }
}

impl ParkedEventStore for DurableStore {
    fn park(&self, event: &ParkedEvent) -> event_buffer::Result<()> {
        self.commit(Mutation::ParkEvent(event.clone()))?;
        Ok(())
    }

    fn parked(&self, key: &StreamKey) -> event_buffer::Result<Vec<ParkedEvent>> {
        self.state.parked(key)
    }

    fn unpark(&self, key: &StreamKey, version: i64) -> event_buffer::Result<()> {
        self.commit(Mutation::UnparkEvent {
            key: key.clone(),
            version,
        })?;
        Ok(())
    }

    fn parked_keys(&self) -> event_buffer::Result<Vec<StreamKey>> {
        self.state.parked_keys()
    }
}

impl EventBufferStore for DurableStore {
    fn release(
        &self,
        position: &StreamPosition,
        consumed: &BufferedEvent,
    ) -> event_buffer::Result<()> {
        self.commit(Mutation::Release {
            position: position.clone(),
            consumed_version: consumed.version,
        })?;
        Ok(())
    }
}
