use anyhow::bail;
use chrono::SecondsFormat;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};

use event_buffer::store::{BufferStore, MemoryStore, PositionStore, StreamStatusStore};
use event_buffer::{EventSerializer, JsonEventSerializer, StreamKey};
use event_buffer_persistence::load_state;
use std::collections::BTreeSet;
use std::path::Path;
use uuid::Uuid;

use super::require_store;

/// Every key for `stream_id` under `component`, optionally narrowed to one source.
fn matching_keys(
    state: &MemoryStore,
    stream_id: Uuid,
    source: Option<&str>,
    component: &str,
) -> BTreeSet<StreamKey> {
    let statuses = state.all_statuses().into_iter().map(|s| s.key);
    let positions = state.all_positions().into_iter().map(|p| p.key);
    let buffered = state.buffer_depths().into_iter().map(|(key, _, _)| key);

    statuses
        .chain(positions)
        .chain(buffered)
        .filter(|key| key.stream_id == stream_id && key.component == component)
        .filter(|key| source.map_or(true, |s| key.source == s))
        .collect()
}

pub fn run(dir: &Path, stream_id: Uuid, source: Option<&str>, component: &str) -> anyhow::Result<()> {
    require_store(dir)?;
    let (state, _) = load_state(dir)?;

    let keys = matching_keys(&state, stream_id, source, component);
    if keys.is_empty() {
        bail!("stream {} not found for component {}", stream_id, component);
    }

    let serializer = JsonEventSerializer;
    for key in keys {
        let position = state.get(&key)?.map_or(0, |p| p.version);
        let first_seen = state
            .find_status(&key)?
            .map(|s| s.updated_at.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "-".to_string());

        println!("\nStream {}", key);
        println!("Position: {}  First seen: {}", position, first_seen);

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Version", "Event", "Event Id", "Status"]);

        let mut expected = position + 1;
        let mut rows = 0usize;
        for row in state.find_by_stream_ascending(&key)? {
            let row = row?;
            let status = if row.version == expected {
                expected += 1;
                "ready"
            } else {
                "waiting"
            };
            let (name, event_id) = match serializer.deserialize(&row.payload) {
                Ok(event) => (event.name, event.event_id.to_string()),
                Err(e) => (format!("<unreadable: {}>", e), "-".to_string()),
            };
            table.add_row(vec![row.version.to_string(), name, event_id, status.to_string()]);
            rows += 1;
        }

        if rows == 0 {
            println!("No buffered events.\n");
        } else {
            println!("Next expected: v{}", expected);
            println!("{table}\n");
        }
    }

    Ok(())
}
