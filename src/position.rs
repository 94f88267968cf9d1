// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Position Initializer
//!
//! Resolves the current position of a stream once per process and serves it
//! from memory afterwards. The cache is a key-partitioned map owned by
//! whoever owns the engine; it is never evicted.
//!
//! # Cold key
//! 1. Record first sight (insert-if-absent status marker, position 0)
//! 2. Read the persisted position, default 0
//! 3. Cache it

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::envelope::StreamKey;
use crate::error::Result;
use crate::store::{PositionStore, StreamStatus, StreamStatusStore};

pub struct PositionInitializer<S> {
    store: Arc<S>,
    positions: Mutex<HashMap<StreamKey, i64>>,
}

impl<S> PositionInitializer<S>
where
    S: PositionStore + StreamStatusStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            positions: Mutex::new(HashMap::new()),
        }
    }

    fn positions(&self) -> MutexGuard<'_, HashMap<StreamKey, i64>> {
        self.positions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current position of `key`. Hits the store only on the first call.
    pub fn resolve_position(&self, key: &StreamKey) -> Result<i64> {
        if let Some(position) = self.positions().get(key) {
            return Ok(*position);
        }

        // The lock is not held across store I/O; one worker per key means
        // no other thread resolves this key concurrently.
        if self.store.insert_or_do_nothing(&StreamStatus::first_sight(key.clone()))? {
            tracing::debug!("First sight of stream {}", key);
        }
        let position = self
            .store
            .get(key)?
            .map(|p| p.version)
            .unwrap_or(0);

        tracing::debug!("Resolved position {} for stream {}", position, key);
        self.positions().insert(key.clone(), position);
        Ok(position)
    }

    /// Record a newly released version.
    pub fn advance(&self, key: &StreamKey, version: i64) {
        self.positions().insert(key.clone(), version);
    }

    pub fn cached(&self, key: &StreamKey) -> Option<i64> {
        self.positions().get(key).copied()
    }

    pub fn cached_streams(&self) -> usize {
        self.positions().len()
    }
}
