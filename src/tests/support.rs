// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Spy store: a `MemoryStore` that counts every interaction and tracks cursors.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::envelope::StreamKey;
use crate::error::{BufferError, Result};
use crate::store::{
    BufferCursor, BufferStore, BufferedEvent, EventBufferStore, MemoryStore, PositionStore,
    StreamPosition, StreamStatus, StreamStatusStore,
};

#[derive(Default)]
pub struct SpyStore {
    pub inner: MemoryStore,
    position_reads: AtomicUsize,
    position_writes: AtomicUsize,
    buffer_inserts: AtomicUsize,
    buffer_finds: AtomicUsize,
    buffer_removes: AtomicUsize,
    status_writes: AtomicUsize,
    open_cursors: AtomicUsize,
    closed_cursors: AtomicUsize,
    released: Mutex<Vec<i64>>,
    fail_upserts: AtomicBool,
    fail_releases: AtomicBool,
}

fn offline() -> BufferError {
    BufferError::persistence(io::Error::new(io::ErrorKind::Other, "store offline"))
}

impl SpyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reset(&self) {
        for counter in [
            &self.position_reads,
            &self.position_writes,
            &self.buffer_inserts,
            &self.buffer_finds,
            &self.buffer_removes,
            &self.status_writes,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
        self.released.lock().unwrap().clear();
    }

    pub fn total_interactions(&self) -> usize {
        self.position_reads.load(Ordering::SeqCst)
            + self.position_writes.load(Ordering::SeqCst)
            + self.buffer_inserts.load(Ordering::SeqCst)
            + self.buffer_finds.load(Ordering::SeqCst)
            + self.buffer_removes.load(Ordering::SeqCst)
            + self.status_writes.load(Ordering::SeqCst)
            + self.released.lock().unwrap().len()
    }

    pub fn position_reads(&self) -> usize {
        self.position_reads.load(Ordering::SeqCst)
    }

    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    pub fn closed_cursors(&self) -> usize {
        self.closed_cursors.load(Ordering::SeqCst)
    }

    /// Make position upserts fail with a persistence error.
    pub fn fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    /// Make atomic releases fail with a persistence error.
    pub fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    pub fn released_versions(&self) -> Vec<i64> {
        self.released.lock().unwrap().clone()
    }
}

struct SpyCursor<'a> {
    inner: BufferCursor<'a>,
    spy: &'a SpyStore,
}

impl Iterator for SpyCursor<'_> {
    type Item = Result<BufferedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl Drop for SpyCursor<'_> {
    fn drop(&mut self) {
        self.spy.open_cursors.fetch_sub(1, Ordering::SeqCst);
        self.spy.closed_cursors.fetch_add(1, Ordering::SeqCst);
    }
}

impl PositionStore for SpyStore {
    fn get(&self, key: &StreamKey) -> Result<Option<StreamPosition>> {
        self.position_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }

    fn upsert(&self, position: &StreamPosition) -> Result<()> {
        self.position_writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(offline());
        }
        self.inner.upsert(position)
    }
}

impl BufferStore for SpyStore {
    fn insert(&self, event: BufferedEvent) -> Result<()> {
        self.buffer_inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(event)
    }

    fn find_by_stream_ascending<'a>(&'a self, key: &StreamKey) -> Result<BufferCursor<'a>> {
        self.buffer_finds.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.find_by_stream_ascending(key)?;
        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SpyCursor { inner, spy: self }))
    }

    fn remove(&self, event: &BufferedEvent) -> Result<()> {
        self.buffer_removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(event)
    }
}

impl StreamStatusStore for SpyStore {
    fn insert_or_do_nothing(&self, status: &StreamStatus) -> Result<bool> {
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.insert_or_do_nothing(status)
    }

    fn find_status(&self, key: &StreamKey) -> Result<Option<StreamStatus>> {
        self.inner.find_status(key)
    }
}

impl EventBufferStore for SpyStore {
    fn release(&self, position: &StreamPosition, consumed: &BufferedEvent) -> Result<()> {
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(offline());
        }
        self.released.lock().unwrap().push(consumed.version);
        self.inner.release(position, consumed)
    }
}
