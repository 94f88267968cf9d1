// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! In-memory store tables.
//!
//! Used on its own for tests and ephemeral nodes, and as the materialized
//! state of the durable store (which replays its log into one of these).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{
    BufferCursor, BufferStore, BufferedEvent, EventBufferStore, Mutation, ParkedEvent,
    ParkedEventStore, PositionStore, ProcessedEvent, ProcessedEventStore, StreamPosition,
    StreamStatus, StreamStatusStore, DEFAULT_FETCH_SIZE,
};
use crate::envelope::StreamKey;
use crate::error::{BufferError, Result};

#[derive(Default)]
struct Tables {
    positions: HashMap<StreamKey, StreamPosition>,
    buffer: HashMap<StreamKey, BTreeMap<i64, BufferedEvent>>,
    statuses: HashMap<StreamKey, StreamStatus>,
    processed: HashMap<(String, String), BTreeMap<u64, ProcessedEvent>>,
    parked: HashMap<StreamKey, BTreeMap<i64, ParkedEvent>>,
}

impl Tables {
    /// `Ok(false)` means the mutation would change nothing.
    fn check(&self, mutation: &Mutation) -> Result<bool> {
        match mutation {
            Mutation::InsertBuffered(event) => {
                let exists = self
                    .buffer
                    .get(&event.key)
                    .map_or(false, |rows| rows.contains_key(&event.version));
                if exists {
                    return Err(BufferError::DuplicateBufferEntry {
                        stream_id: event.key.stream_id,
                        version: event.version,
                        event_source: event.key.source.clone(),
                        component: event.key.component.clone(),
                    });
                }
                Ok(true)
            }
            Mutation::RemoveBuffered { key, version } => Ok(self
                .buffer
                .get(key)
                .map_or(false, |rows| rows.contains_key(version))),
            Mutation::InsertStatus(status) => Ok(!self.statuses.contains_key(&status.key)),
            Mutation::UnparkEvent { key, version } => Ok(self
                .parked
                .get(key)
                .map_or(false, |rows| rows.contains_key(version))),
            Mutation::UpsertPosition(_)
            | Mutation::Release { .. }
            | Mutation::SaveProcessed(_)
            | Mutation::ParkEvent(_) => Ok(true),
        }
    }

    fn remove_buffered(&mut self, key: &StreamKey, version: i64) {
        if let Some(rows) = self.buffer.get_mut(key) {
            rows.remove(&version);
            if rows.is_empty() {
                self.buffer.remove(key);
            }
        }
    }

    fn apply(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::UpsertPosition(position) => {
                self.positions.insert(position.key.clone(), position.clone());
            }
            Mutation::InsertBuffered(event) => {
                self.buffer
                    .entry(event.key.clone())
                    .or_default()
                    .insert(event.version, event.clone());
            }
            Mutation::RemoveBuffered { key, version } => self.remove_buffered(key, *version),
            Mutation::Release {
                position,
                consumed_version,
            } => {
                self.positions.insert(position.key.clone(), position.clone());
                self.remove_buffered(&position.key, *consumed_version);
            }
            Mutation::InsertStatus(status) => {
                self.statuses
                    .entry(status.key.clone())
                    .or_insert_with(|| status.clone());
            }
            Mutation::SaveProcessed(item) => {
                self.processed
                    .entry((item.source.clone(), item.component.clone()))
                    .or_default()
                    .insert(item.event_number, item.clone());
            }
            Mutation::ParkEvent(event) => {
                self.parked
                    .entry(event.key.clone())
                    .or_default()
                    .insert(event.version, event.clone());
            }
            Mutation::UnparkEvent { key, version } => {
                if let Some(rows) = self.parked.get_mut(key) {
                    rows.remove(version);
                    if rows.is_empty() {
                        self.parked.remove(key);
                    }
                }
            }
        }
    }
}

/// Thread-safe store tables held in memory.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fetch_size: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_fetch_size(DEFAULT_FETCH_SIZE)
    }

    /// `fetch_size` bounds how many buffered rows a cursor holds at once.
    pub fn with_fetch_size(fetch_size: usize) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            fetch_size: fetch_size.max(1),
        }
    }

    // Every mutation is applied in a single step under the write lock, so a
    // poisoned lock still guards consistent tables.
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Would `mutation` change anything? Errors on a duplicate buffer row.
    pub fn check(&self, mutation: &Mutation) -> Result<bool> {
        self.read().check(mutation)
    }

    /// Check and apply under one lock. Returns whether anything changed.
    pub fn apply(&self, mutation: &Mutation) -> Result<bool> {
        let mut tables = self.write();
        if !tables.check(mutation)? {
            return Ok(false);
        }
        tables.apply(mutation);
        Ok(true)
    }

    /// Minimal mutation list that rebuilds the current tables.
    pub fn mutations(&self) -> Vec<Mutation> {
        let tables = self.read();
        let mut out = Vec::new();

        let mut statuses: Vec<_> = tables.statuses.values().cloned().collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        out.extend(statuses.into_iter().map(Mutation::InsertStatus));

        let mut positions: Vec<_> = tables.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.key.cmp(&b.key));
        out.extend(positions.into_iter().map(Mutation::UpsertPosition));

        let mut keys: Vec<_> = tables.buffer.keys().cloned().collect();
        keys.sort();
        for key in keys {
            if let Some(rows) = tables.buffer.get(&key) {
                out.extend(rows.values().cloned().map(Mutation::InsertBuffered));
            }
        }

        let mut scopes: Vec<_> = tables.processed.keys().cloned().collect();
        scopes.sort();
        for scope in scopes {
            if let Some(items) = tables.processed.get(&scope) {
                out.extend(items.values().cloned().map(Mutation::SaveProcessed));
            }
        }

        let mut keys: Vec<_> = tables.parked.keys().cloned().collect();
        keys.sort();
        for key in keys {
            if let Some(rows) = tables.parked.get(&key) {
                out.extend(rows.values().cloned().map(Mutation::ParkEvent));
            }
        }

        out
    }

    pub fn all_positions(&self) -> Vec<StreamPosition> {
        let mut positions: Vec<_> = self.read().positions.values().cloned().collect();
        positions.sort_by(|a, b| a.key.cmp(&b.key));
        positions
    }

    pub fn all_statuses(&self) -> Vec<StreamStatus> {
        let mut statuses: Vec<_> = self.read().statuses.values().cloned().collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    /// Number of buffered rows per key, and the lowest buffered version.
    pub fn buffer_depths(&self) -> Vec<(StreamKey, usize, i64)> {
        let tables = self.read();
        let mut depths: Vec<_> = tables
            .buffer
            .iter()
            .filter_map(|(key, rows)| {
                rows.keys()
                    .next()
                    .map(|lowest| (key.clone(), rows.len(), *lowest))
            })
            .collect();
        depths.sort_by(|a, b| a.0.cmp(&b.0));
        depths
    }

    pub fn buffered_len(&self) -> usize {
        self.read().buffer.values().map(BTreeMap::len).sum()
    }

    pub fn parked_len(&self) -> usize {
        self.read().parked.values().map(BTreeMap::len).sum()
    }

    fn fetch_page(&self, key: &StreamKey, after: i64) -> Vec<BufferedEvent> {
        let tables = self.read();
        match tables.buffer.get(key) {
            Some(rows) => rows
                .range(after.saturating_add(1)..)
                .take(self.fetch_size)
                .map(|(_, event)| event.clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Pages through one key's buffered rows without holding the lock between pages.
struct PagedCursor<'a> {
    store: &'a MemoryStore,
    key: StreamKey,
    after: i64,
    page: VecDeque<BufferedEvent>,
    exhausted: bool,
}

impl Iterator for PagedCursor<'_> {
    type Item = Result<BufferedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            let page = self.store.fetch_page(&self.key, self.after);
            self.exhausted = page.len() < self.store.fetch_size;
            self.page.extend(page);
        }

        let event = self.page.pop_front()?;
        self.after = event.version;
        Some(Ok(event))
    }
}

impl Drop for PagedCursor<'_> {
    fn drop(&mut self) {
        tracing::trace!("Buffer cursor for {} released at version {}", self.key, self.after);
    }
}

impl PositionStore for MemoryStore {
    fn get(&self, key: &StreamKey) -> Result<Option<StreamPosition>> {
        Ok(self.read().positions.get(key).cloned())
    }

    fn upsert(&self, position: &StreamPosition) -> Result<()> {
        self.apply(&Mutation::UpsertPosition(position.clone()))?;
        Ok(())
    }
}

impl BufferStore for MemoryStore {
    fn insert(&self, event: BufferedEvent) -> Result<()> {
        self.apply(&Mutation::InsertBuffered(event))?;
        Ok(())
    }

    fn find_by_stream_ascending<'a>(&'a self, key: &StreamKey) -> Result<BufferCursor<'a>> {
        Ok(Box::new(PagedCursor {
            store: self,
            key: key.clone(),
            after: 0,
            page: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn remove(&self, event: &BufferedEvent) -> Result<()> {
        self.apply(&Mutation::RemoveBuffered {
            key: event.key.clone(),
            version: event.version,
        })?;
        Ok(())
    }
}

impl StreamStatusStore for MemoryStore {
    fn insert_or_do_nothing(&self, status: &StreamStatus) -> Result<bool> {
        self.apply(&Mutation::InsertStatus(status.clone()))
    }

    fn find_status(&self, key: &StreamKey) -> Result<Option<StreamStatus>> {
        Ok(self.read().statuses.get(key).cloned())
    }
}

impl ProcessedEventStore for MemoryStore {
    fn save(&self, item: &ProcessedEvent) -> Result<()> {
        self.apply(&Mutation::SaveProcessed(item.clone()))?;
        Ok(())
    }

    fn all_descending(&self, source: &str, component: &str) -> Result<Vec<ProcessedEvent>> {
        let tables = self.read();
        Ok(tables
            .processed
            .get(&(source.to_string(), component.to_string()))
            .map(|items| items.values().rev().cloned().collect())
            .unwrap_or_default())
    }

    fn latest(&self, source: &str, component: &str) -> Result<Option<ProcessedEvent>> {
        let tables = self.read();
        Ok(tables
            .processed
            .get(&(source.to_string(), component.to_string()))
            .and_then(|items| items.values().next_back().cloned()))
    }
}

impl ParkedEventStore for MemoryStore {
    fn park(&self, event: &ParkedEvent) -> Result<()> {
        self.apply(&Mutation::ParkEvent(event.clone()))?;
        Ok(())
    }

    fn parked(&self, key: &StreamKey) -> Result<Vec<ParkedEvent>> {
        Ok(self
            .read()
            .parked
            .get(key)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn unpark(&self, key: &StreamKey, version: i64) -> Result<()> {
        self.apply(&Mutation::UnparkEvent {
            key: key.clone(),
            version,
        })?;
        Ok(())
    }

    fn parked_keys(&self) -> Result<Vec<StreamKey>> {
        let mut keys: Vec<_> = self.read().parked.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

impl EventBufferStore for MemoryStore {
    fn release(&self, position: &StreamPosition, consumed: &BufferedEvent) -> Result<()> {
        self.apply(&Mutation::Release {
            position: position.clone(),
            consumed_version: consumed.version,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn key() -> StreamKey {
        StreamKey::new(Uuid::new_v4(), "ctx", "EVENT_LISTENER")
    }

    #[test]
    fn test_position_upsert_is_last_write_wins() {
        let store = MemoryStore::new();
        let key = key();

        assert!(store.get(&key).unwrap().is_none());
        store.upsert(&StreamPosition::new(key.clone(), 3)).unwrap();
        store.upsert(&StreamPosition::new(key.clone(), 5)).unwrap();

        assert_eq!(store.get(&key).unwrap().unwrap().version, 5);
        assert_eq!(store.all_positions().len(), 1);
    }

    #[test]
    fn test_buffer_rejects_duplicate_rows() {
        let store = MemoryStore::new();
        let key = key();

        store.insert(BufferedEvent::new(key.clone(), 6, "a")).unwrap();
        let err = store.insert(BufferedEvent::new(key.clone(), 6, "b")).unwrap_err();

        assert!(matches!(err, BufferError::DuplicateBufferEntry { version: 6, .. }));
        assert!(err.to_string().contains(&format!("source={}", key.source)));
        let rows: Vec<_> = store
            .find_by_stream_ascending(&key)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload, "a");
    }

    #[test]
    fn test_cursor_is_ascending_and_paged() {
        let store = MemoryStore::with_fetch_size(2);
        let key = key();
        let other = StreamKey::new(key.stream_id, "other-source", "EVENT_LISTENER");

        for version in [9, 4, 6, 5, 8] {
            store.insert(BufferedEvent::new(key.clone(), version, "x")).unwrap();
        }
        store.insert(BufferedEvent::new(other, 7, "y")).unwrap();

        let versions: Vec<i64> = store
            .find_by_stream_ascending(&key)
            .unwrap()
            .map(|row| row.unwrap().version)
            .collect();

        assert_eq!(versions, vec![4, 5, 6, 8, 9]);
    }

    #[test]
    fn test_cursor_sees_rows_removed_between_pages() {
        let store = MemoryStore::with_fetch_size(1);
        let key = key();
        for version in 1..=3 {
            store.insert(BufferedEvent::new(key.clone(), version, "x")).unwrap();
        }

        let mut cursor = store.find_by_stream_ascending(&key).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().version, 1);
        store.remove(&BufferedEvent::new(key.clone(), 2, "x")).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().version, 3);
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = MemoryStore::new();
        let row = BufferedEvent::new(key(), 2, "x");

        store.insert(row.clone()).unwrap();
        store.remove(&row).unwrap();
        store.remove(&row).unwrap();

        assert_eq!(store.buffered_len(), 0);
        assert!(!store.check(&Mutation::RemoveBuffered { key: row.key, version: 2 }).unwrap());
    }

    #[test]
    fn test_release_moves_position_and_drops_row() {
        let store = MemoryStore::new();
        let key = key();
        let row = BufferedEvent::new(key.clone(), 4, "x");
        store.insert(row.clone()).unwrap();

        store.release(&StreamPosition::new(key.clone(), 4), &row).unwrap();

        assert_eq!(store.get(&key).unwrap().unwrap().version, 4);
        assert_eq!(store.buffered_len(), 0);
    }

    #[test]
    fn test_status_insert_never_overwrites() {
        let store = MemoryStore::new();
        let key = key();
        let first = StreamStatus::first_sight(key.clone());
        let mut second = first.clone();
        second.position = 10;

        assert!(store.insert_or_do_nothing(&first).unwrap());
        assert!(!store.insert_or_do_nothing(&second).unwrap());
        assert_eq!(store.find_status(&key).unwrap().unwrap().position, 0);
    }

    #[test]
    fn test_processed_events_are_scoped_and_descending() {
        let store = MemoryStore::new();
        for (prev, num, source) in [(1, 2, "a"), (0, 1, "a"), (99, 100, "b"), (3, 4, "a"), (2, 3, "a")] {
            store
                .save(&ProcessedEvent {
                    previous_event_number: prev,
                    event_number: num,
                    source: source.to_string(),
                    component: "EVENT_LISTENER".to_string(),
                })
                .unwrap();
        }

        let numbers: Vec<u64> = store
            .all_descending("a", "EVENT_LISTENER")
            .unwrap()
            .iter()
            .map(|p| p.event_number)
            .collect();
        assert_eq!(numbers, vec![4, 3, 2, 1]);

        let latest = store.latest("a", "EVENT_LISTENER").unwrap().unwrap();
        assert_eq!((latest.previous_event_number, latest.event_number), (3, 4));
        assert!(store.latest("a", "OTHER").unwrap().is_none());
    }

    #[test]
    fn test_mutations_rebuild_identical_tables() {
        let store = MemoryStore::new();
        let key = key();
        store.insert_or_do_nothing(&StreamStatus::first_sight(key.clone())).unwrap();
        store.upsert(&StreamPosition::new(key.clone(), 2)).unwrap();
        store.insert(BufferedEvent::new(key.clone(), 5, "five")).unwrap();
        store.park(&parked(&key, 2, 1)).unwrap();

        let copy = MemoryStore::new();
        for mutation in store.mutations() {
            copy.apply(&mutation).unwrap();
        }

        assert_eq!(copy.all_positions(), store.all_positions());
        assert_eq!(copy.all_statuses(), store.all_statuses());
        assert_eq!(copy.parked(&key).unwrap(), store.parked(&key).unwrap());
        assert_eq!(copy.buffer_depths(), vec![(key, 1, 5)]);
    }

    fn parked(key: &StreamKey, version: i64, attempts: u32) -> ParkedEvent {
        ParkedEvent {
            key: key.clone(),
            version,
            payload: format!("v{}", version),
            attempts,
            last_error: None,
        }
    }

    #[test]
    fn test_parked_rows_are_ascending_and_replaceable() {
        let store = MemoryStore::new();
        let key = key();

        store.park(&parked(&key, 4, 0)).unwrap();
        store.park(&parked(&key, 3, 1)).unwrap();
        store.park(&parked(&key, 3, 2)).unwrap();

        let rows = store.parked(&key).unwrap();
        let versions: Vec<_> = rows.iter().map(|r| (r.version, r.attempts)).collect();
        assert_eq!(versions, vec![(3, 2), (4, 0)]);
        assert_eq!(store.parked_keys().unwrap(), vec![key.clone()]);

        store.unpark(&key, 3).unwrap();
        store.unpark(&key, 3).unwrap();
        store.unpark(&key, 4).unwrap();
        assert!(store.parked(&key).unwrap().is_empty());
        assert!(store.parked_keys().unwrap().is_empty());
        assert_eq!(store.parked_len(), 0);
    }
}
