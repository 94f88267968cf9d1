//! Sample store directories for tests and demos.

use crate::durable::{DurableStore, StoreOptions};
use crate::error::Result;
use event_buffer::store::{
    BufferStore, BufferedEvent, PositionStore, ProcessedEvent, ProcessedEventStore,
    StreamPosition, StreamStatus, StreamStatusStore,
};
use event_buffer::{EventEnvelope, EventSerializer, JsonEventSerializer, StreamKey};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const FIXTURE_COMPONENT: &str = "EVENT_LISTENER";

/// Stream with a gap: released up to 3, holding 5 and 6.
pub const GAPPED_STREAM: Uuid = Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_00a1);
/// Fully caught-up stream at version 2.
pub const CAUGHT_UP_STREAM: Uuid = Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_00b2);

pub struct FixturePaths {
    pub dir: PathBuf,
    pub log: PathBuf,
}

fn buffered(key: &StreamKey, version: i64) -> Result<BufferedEvent> {
    let envelope = EventEnvelope::new("orders.line_added", key.stream_id, version)
        .with_payload(serde_json::json!({ "line": version }));
    let payload = JsonEventSerializer.serialize(&envelope)?;
    Ok(BufferedEvent::new(key.clone(), version, payload))
}

/// Writes a store in `dir` with one gapped stream and one caught-up stream.
pub fn generate_store_fixture(dir: &Path) -> Result<FixturePaths> {
    let store = DurableStore::open(dir, StoreOptions::default())?;

    let gapped = StreamKey::new(GAPPED_STREAM, "orders", FIXTURE_COMPONENT);
    let caught_up = StreamKey::new(CAUGHT_UP_STREAM, "billing", FIXTURE_COMPONENT);

    for key in [&gapped, &caught_up] {
        store.insert_or_do_nothing(&StreamStatus::first_sight(key.clone()))?;
    }
    store.upsert(&StreamPosition::new(gapped.clone(), 3))?;
    store.insert(buffered(&gapped, 5)?)?;
    store.insert(buffered(&gapped, 6)?)?;
    store.upsert(&StreamPosition::new(caught_up, 2))?;

    for (previous, current) in [(0u64, 10u64), (10, 11), (11, 14)] {
        store.save(&ProcessedEvent {
            previous_event_number: previous,
            event_number: current,
            source: "orders".to_string(),
            component: FIXTURE_COMPONENT.to_string(),
        })?;
    }

    Ok(FixturePaths {
        dir: dir.to_path_buf(),
        log: store.log_path(),
    })
}
