// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Persisted state behind the ordering engine.
//!
//! # Tables
//! - positions = last consecutively released version per [`StreamKey`]
//! - buffer    = events that arrived ahead of their turn, unique on (key, version)
//! - status    = first-sight markers, insert-if-absent only
//! - processed = global event numbers handled per (source, component)
//! - parked    = released events the handler has not yet accepted, per key
//!
//! # Atomicity
//! Releasing a buffered event touches two tables. [`EventBufferStore::release`]
//! applies the position upsert and the buffer removal as one unit, so a crash
//! between them can only lose forward progress.

pub mod memory;
pub mod mutation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::StreamKey;
use crate::error::Result;

pub use memory::MemoryStore;
pub use mutation::Mutation;

/// Default number of buffered rows fetched per cursor page.
pub const DEFAULT_FETCH_SIZE: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    pub key: StreamKey,
    pub version: i64,
}

impl StreamPosition {
    pub fn new(key: StreamKey, version: i64) -> Self {
        Self { key, version }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedEvent {
    pub key: StreamKey,
    pub version: i64,
    /// Serialized envelope, opaque to the store.
    pub payload: String,
}

impl BufferedEvent {
    pub fn new(key: StreamKey, version: i64, payload: impl Into<String>) -> Self {
        Self {
            key,
            version,
            payload: payload.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub key: StreamKey,
    pub position: i64,
    pub updated_at: DateTime<Utc>,
}

impl StreamStatus {
    /// Marker for a stream seen for the first time.
    pub fn first_sight(key: StreamKey) -> Self {
        Self {
            key,
            position: 0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub previous_event_number: u64,
    pub event_number: u64,
    pub source: String,
    pub component: String,
}

/// A released event waiting for redelivery after a handler failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedEvent {
    pub key: StreamKey,
    pub version: i64,
    /// Serialized envelope, opaque to the store.
    pub payload: String,
    /// Failed handler attempts so far. Zero for an event parked behind an
    /// earlier failure.
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Lazy, ascending sequence of buffered rows. Dropping it releases the cursor.
pub type BufferCursor<'a> = Box<dyn Iterator<Item = Result<BufferedEvent>> + Send + 'a>;

pub trait PositionStore: Send + Sync {
    fn get(&self, key: &StreamKey) -> Result<Option<StreamPosition>>;

    /// Write-or-replace keyed by the stream key. Last write wins.
    fn upsert(&self, position: &StreamPosition) -> Result<()>;
}

pub trait BufferStore: Send + Sync {
    /// Fails with `DuplicateBufferEntry` if the (key, version) row exists.
    fn insert(&self, event: BufferedEvent) -> Result<()>;

    /// Rows for one key, ascending by version, fetched page by page.
    fn find_by_stream_ascending<'a>(&'a self, key: &StreamKey) -> Result<BufferCursor<'a>>;

    /// Deletes exactly the matching row. No-op if already gone.
    fn remove(&self, event: &BufferedEvent) -> Result<()>;
}

pub trait StreamStatusStore: Send + Sync {
    /// Returns `true` if the marker was inserted, `false` if one already existed.
    fn insert_or_do_nothing(&self, status: &StreamStatus) -> Result<bool>;

    fn find_status(&self, key: &StreamKey) -> Result<Option<StreamStatus>>;
}

pub trait ProcessedEventStore: Send + Sync {
    fn save(&self, item: &ProcessedEvent) -> Result<()>;

    /// Highest event number first.
    fn all_descending(&self, source: &str, component: &str) -> Result<Vec<ProcessedEvent>>;

    fn latest(&self, source: &str, component: &str) -> Result<Option<ProcessedEvent>>;
}

pub trait ParkedEventStore: Send + Sync {
    /// Insert or replace the row for (key, version).
    fn park(&self, event: &ParkedEvent) -> Result<()>;

    /// Parked rows for one key, ascending by version.
    fn parked(&self, key: &StreamKey) -> Result<Vec<ParkedEvent>>;

    /// Deletes the row. No-op if already gone.
    fn unpark(&self, key: &StreamKey, version: i64) -> Result<()>;

    /// Keys with at least one parked row.
    fn parked_keys(&self) -> Result<Vec<StreamKey>>;
}

/// Everything the ordering engine needs from persistence.
pub trait EventBufferStore: PositionStore + BufferStore + StreamStatusStore {
    /// Advance `position` and remove `consumed` in one atomic write.
    fn release(&self, position: &StreamPosition, consumed: &BufferedEvent) -> Result<()>;
}
