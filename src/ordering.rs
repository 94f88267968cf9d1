// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Consecutive Event Buffer - the ordering engine
//!
//! Decides for each incoming event whether to release it, hold it until its
//! predecessors arrive, or drop it as already seen.
//!
//! # Decision
//! ```text
//! expected = position + 1
//! version <  expected  -> obsolete, empty result, no position or buffer writes
//! version == expected  -> release it, then drain consecutive buffered rows
//! version >  expected  -> buffer it, empty result
//! ```
//!
//! # Guarantees
//! - Released sequence is gap-free, strictly increasing, starts at `expected`
//! - Buffered rows are fetched and released lazily as the sequence is consumed
//! - Each buffered release (position + row removal) is one atomic store write
//! - Dropping the sequence releases the buffer cursor on every exit path
//!
//! One worker per stream key is assumed; calls for the same key are not
//! serialized here.

use std::sync::Arc;

use crate::envelope::{EventEnvelope, StreamKey};
use crate::error::Result;
use crate::position::PositionInitializer;
use crate::serializer::{EventSerializer, JsonEventSerializer};
use crate::store::{BufferCursor, BufferedEvent, EventBufferStore, StreamPosition};

/// What `accept_event` did with the incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Already released (or superseded); dropped.
    Obsolete,
    /// Ahead of the expected version; stored for later.
    Buffered,
    /// Released, possibly followed by buffered successors.
    Released,
}

pub struct ConsecutiveEventBuffer<S> {
    store: Arc<S>,
    initializer: PositionInitializer<S>,
    serializer: Arc<dyn EventSerializer>,
    component: String,
}

impl<S: EventBufferStore> ConsecutiveEventBuffer<S> {
    pub fn new(store: Arc<S>, component: impl Into<String>) -> Self {
        Self {
            initializer: PositionInitializer::new(store.clone()),
            store,
            serializer: Arc::new(JsonEventSerializer),
            component: component.into(),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn EventSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn serializer(&self) -> &Arc<dyn EventSerializer> {
        &self.serializer
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn initializer(&self) -> &PositionInitializer<S> {
        &self.initializer
    }

    /// Accept one event and return the events now releasable, in order.
    ///
    /// Fails synchronously on a missing stream id or a version < 1, before
    /// any store access.
    ///
    /// An obsolete event never writes to the position or buffer tables. On a
    /// key not yet seen by this process, resolving its position may still
    /// insert the first-sight status marker.
    pub fn accept_event(&self, event: EventEnvelope) -> Result<OrderedEvents<'_, S>> {
        let (key, version) = event.ordering_key(&self.component)?;
        let position = self.initializer.resolve_position(&key)?;
        let expected = position + 1;

        if version < expected {
            tracing::debug!(
                "Obsolete event '{}' v{} for stream {} (position {})",
                event.name,
                version,
                key,
                position
            );
            return Ok(OrderedEvents::empty(Disposition::Obsolete));
        }

        if version > expected {
            let payload = self.serializer.serialize(&event)?;
            self.store
                .insert(BufferedEvent::new(key.clone(), version, payload))?;
            tracing::debug!(
                "Buffered event '{}' v{} for stream {} (expected v{})",
                event.name,
                version,
                key,
                expected
            );
            return Ok(OrderedEvents::empty(Disposition::Buffered));
        }

        self.store
            .upsert(&StreamPosition::new(key.clone(), version))?;
        self.initializer.advance(&key, version);
        tracing::debug!("Released event '{}' v{} for stream {}", event.name, version, key);

        let cursor = self.store.find_by_stream_ascending(&key)?;
        Ok(OrderedEvents {
            head: Some(event),
            drain: Some(Drain {
                engine: self,
                key,
                next_version: version + 1,
                cursor,
            }),
            disposition: Disposition::Released,
        })
    }
}

/// Lazy release sequence returned by [`ConsecutiveEventBuffer::accept_event`].
pub struct OrderedEvents<'a, S> {
    head: Option<EventEnvelope>,
    drain: Option<Drain<'a, S>>,
    disposition: Disposition,
}

impl<'a, S: EventBufferStore> OrderedEvents<'a, S> {
    fn empty(disposition: Disposition) -> Self {
        Self {
            head: None,
            drain: None,
            disposition,
        }
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    /// Stop early. The buffer cursor is released; unconsumed rows stay buffered.
    pub fn close(self) {}
}

impl<S: EventBufferStore> Iterator for OrderedEvents<'_, S> {
    type Item = Result<EventEnvelope>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(head) = self.head.take() {
            return Some(Ok(head));
        }

        let step = self.drain.as_mut()?.step();
        // Stop draining at the first gap or error; dropping the drain drops the cursor.
        match step {
            Some(Ok(event)) => Some(Ok(event)),
            other => {
                self.drain = None;
                other
            }
        }
    }
}

struct Drain<'a, S> {
    engine: &'a ConsecutiveEventBuffer<S>,
    key: StreamKey,
    next_version: i64,
    cursor: BufferCursor<'a>,
}

impl<S: EventBufferStore> Drain<'_, S> {
    fn step(&mut self) -> Option<Result<EventEnvelope>> {
        loop {
            let row = match self.cursor.next()? {
                Ok(row) => row,
                Err(e) => return Some(Err(e)),
            };

            if row.version < self.next_version {
                tracing::warn!(
                    "Removing stale buffered v{} for stream {} (next is v{})",
                    row.version,
                    self.key,
                    self.next_version
                );
                if let Err(e) = self.engine.store.remove(&row) {
                    return Some(Err(e));
                }
                continue;
            }

            if row.version > self.next_version {
                tracing::debug!(
                    "Gap at v{} for stream {}; v{} stays buffered",
                    self.next_version,
                    self.key,
                    row.version
                );
                return None;
            }

            return Some(self.release(row));
        }
    }

    fn release(&mut self, row: BufferedEvent) -> Result<EventEnvelope> {
        let event = self.engine.serializer.deserialize(&row.payload)?;
        let position = StreamPosition::new(self.key.clone(), row.version);

        self.engine.store.release(&position, &row)?;
        self.engine.initializer.advance(&self.key, row.version);
        self.next_version = row.version + 1;

        tracing::debug!("Released buffered v{} for stream {}", row.version, self.key);
        Ok(event)
    }
}
