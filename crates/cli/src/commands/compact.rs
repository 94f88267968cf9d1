use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};

use event_buffer_persistence::{CompactionStats, DurableStore, StoreOptions};
use std::fs;
use std::path::Path;

use super::require_store;

/// Rewrites the store log with live rows only.
pub fn run(dir: &Path) -> anyhow::Result<CompactionStats> {
    require_store(dir)?;
    let store = DurableStore::open(dir, StoreOptions::default())?;
    let size_before = fs::metadata(store.log_path())?.len();
    let stats = store.compact()?;
    let size_after = fs::metadata(store.log_path())?.len();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["", "Entries", "Bytes"]);
    table.add_row(vec![
        "Before".to_string(),
        stats.entries_before.to_string(),
        size_before.to_string(),
    ]);
    table.add_row(vec![
        "After".to_string(),
        stats.entries_after.to_string(),
        size_after.to_string(),
    ]);
    println!("\nCompacted {}\n{table}\n", store.log_path().display());

    Ok(stats)
}
