// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Line-delimited JSON event input.

use crate::dispatcher::StreamDispatcher;
use crate::errors::NodeError;
use crate::telemetry::EVENTS_REJECTED;
use event_buffer::store::{EventBufferStore, ParkedEventStore, ProcessedEventStore};
use event_buffer::{EventSerializer, JsonEventSerializer};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub dispatched: u64,
    pub rejected: u64,
}

/// Reads one JSON envelope per line and dispatches it. Blank lines are skipped.
///
/// Malformed lines and invalid events are logged and counted, not fatal.
pub async fn ingest_lines<R, S>(
    reader: R,
    dispatcher: &StreamDispatcher<S>,
) -> Result<IngestSummary, NodeError>
where
    R: AsyncBufRead + Unpin,
    S: EventBufferStore + ProcessedEventStore + ParkedEventStore + 'static,
{
    let serializer = JsonEventSerializer;
    let mut summary = IngestSummary::default();
    let mut lines = reader.lines();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event = match serializer.deserialize(&line) {
            Ok(event) => event,
            Err(e) => {
                metrics::counter!(EVENTS_REJECTED, 1);
                warn!("Line {}: {}", line_no, e);
                summary.rejected += 1;
                continue;
            }
        };
        match dispatcher.dispatch(event) {
            Ok(()) => summary.dispatched += 1,
            Err(e) if e.is_rejection() => {
                warn!("Line {}: {}", line_no, e);
                summary.rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(summary)
}
