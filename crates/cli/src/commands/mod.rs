pub mod compact;
pub mod inspect;
pub mod replay;
pub mod stream;

use anyhow::bail;
use event_buffer_persistence::LOG_FILE;
use std::path::Path;

/// Fails unless `dir` holds a store log.
pub(crate) fn require_store(dir: &Path) -> anyhow::Result<()> {
    if !dir.join(LOG_FILE).exists() {
        bail!("no store found in {:?} (missing {})", dir, LOG_FILE);
    }
    Ok(())
}
