use anyhow::Context;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};

use event_buffer::{ConsecutiveEventBuffer, Disposition, EventSerializer, JsonEventSerializer};
use event_buffer_persistence::{DurableStore, StoreOptions};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub obsolete: u64,
    pub buffered: u64,
    pub released: u64,
    pub rejected: u64,
}

/// Feeds a JSONL event file through the ordering engine on the store in `dir`.
///
/// The store is created if it does not exist yet.
pub fn run(dir: &Path, events: &Path, component: &str) -> anyhow::Result<ReplaySummary> {
    let input = File::open(events).with_context(|| format!("opening {:?}", events))?;
    let store = Arc::new(DurableStore::open(dir, StoreOptions::default())?);
    let engine = ConsecutiveEventBuffer::new(store, component);
    let serializer = JsonEventSerializer;

    let mut summary = ReplaySummary::default();
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Line", "Event", "Version", "Outcome"]);

    for (idx, line) in BufReader::new(input).lines().enumerate() {
        let line = line?;
        let line_no = (idx + 1).to_string();
        if line.trim().is_empty() {
            continue;
        }

        let event = match serializer.deserialize(&line) {
            Ok(event) => event,
            Err(e) => {
                summary.rejected += 1;
                table.add_row(vec![line_no, "-".to_string(), "-".to_string(), e.to_string()]);
                continue;
            }
        };
        let name = event.name.clone();
        let version = event.version.map_or("-".to_string(), |v| v.to_string());

        let released = match engine.accept_event(event) {
            Ok(released) => released,
            Err(e) if e.is_validation() => {
                summary.rejected += 1;
                table.add_row(vec![line_no, name, version, e.to_string()]);
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("line {}", line_no)),
        };

        match released.disposition() {
            Disposition::Obsolete => {
                summary.obsolete += 1;
                table.add_row(vec![line_no, name, version, "obsolete".to_string()]);
            }
            Disposition::Buffered => {
                summary.buffered += 1;
                table.add_row(vec![line_no, name, version, "buffered".to_string()]);
            }
            Disposition::Released => {
                let mut versions = Vec::new();
                for item in released {
                    let item = item.with_context(|| format!("line {}", line_no))?;
                    versions.push(item.version.map_or("?".to_string(), |v| format!("v{}", v)));
                }
                summary.released += versions.len() as u64;
                table.add_row(vec![
                    line_no,
                    name,
                    version,
                    format!("released {}", versions.join(", ")),
                ]);
            }
        }
    }

    println!("\n{table}");
    println!(
        "released {}, buffered {}, obsolete {}, rejected {}\n",
        summary.released, summary.buffered, summary.obsolete, summary.rejected
    );
    Ok(summary)
}
