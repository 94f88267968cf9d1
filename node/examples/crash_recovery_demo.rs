// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Crash Recovery Demo
//!
//! Delivers a shuffled stream, "crashes" halfway, reopens the store and
//! finishes. The handler still sees every version exactly once, in order.

use event_buffer::{ConsecutiveEventBuffer, EventEnvelope};
use event_buffer_node::dispatcher::StreamDispatcher;
use event_buffer_node::handler::HandlerError;
use event_buffer_persistence::{DurableStore, StoreOptions};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use uuid::Uuid;

const COMPONENT: &str = "EVENT_LISTENER";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n=== Event Buffer Crash Recovery Demo ===\n");

    let dir = tempdir()?;
    let stream_id = Uuid::new_v4();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        move |event: &EventEnvelope| -> Result<(), HandlerError> {
            if let (Ok(mut seen), Some(v)) = (seen.lock(), event.version) {
                seen.push(v);
            }
            Ok(())
        }
    };
    let handler = Arc::new(handler);

    println!("Phase 1: deliver 1, 6, 2, 5, 4 and stop");
    {
        let store = Arc::new(DurableStore::open(dir.path(), StoreOptions::default())?);
        let dispatcher = StreamDispatcher::new(
            ConsecutiveEventBuffer::new(store.clone(), COMPONENT),
            handler.clone(),
        );
        for v in [1, 6, 2, 5, 4] {
            dispatcher.dispatch(EventEnvelope::new("demo.step", stream_id, v))?;
        }
        dispatcher.shutdown(Duration::from_secs(5)).await?;
        println!(
            "   released so far: {:?}, buffered: {}\n",
            seen.lock().map(|s| s.clone()).unwrap_or_default(),
            store.state().buffered_len()
        );
    }

    println!("Phase 2: reopen and deliver the missing v3");
    let store = Arc::new(DurableStore::open(dir.path(), StoreOptions::default())?);
    println!("   replayed {} log entries", store.recovery().replayed);
    let dispatcher = StreamDispatcher::new(ConsecutiveEventBuffer::new(store.clone(), COMPONENT), handler);
    dispatcher.dispatch(EventEnvelope::new("demo.step", stream_id, 3))?;
    dispatcher.shutdown(Duration::from_secs(5)).await?;

    println!(
        "   released overall: {:?}, buffered: {}\n",
        seen.lock().map(|s| s.clone()).unwrap_or_default(),
        store.state().buffered_len()
    );
    Ok(())
}
