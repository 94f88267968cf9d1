// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use event_buffer::store::{EventBufferStore, MemoryStore, ParkedEventStore, ProcessedEventStore};
use event_buffer::{ConsecutiveEventBuffer, WaitOutcome};
use event_buffer_node::config::NodeConfig;
use event_buffer_node::dispatcher::StreamDispatcher;
use event_buffer_node::errors::NodeError;
use event_buffer_node::handler::LoggingHandler;
use event_buffer_node::ingest::ingest_lines;
use event_buffer_node::telemetry::{init_telemetry, render_metrics};
use event_buffer_persistence::{DurableStore, StoreOptions};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("event-buffer-node: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), NodeError> {
    init_telemetry()?;
    let cfg = NodeConfig::from_env()?;
    tracing::info!("Initializing event buffer node with config: {:?}", cfg);

    match cfg.store_dir.clone() {
        Some(dir) => {
            let options = StoreOptions {
                fetch_size: cfg.fetch_size,
                ..StoreOptions::default()
            };
            let store = Arc::new(DurableStore::open(&dir, options)?);
            serve(store.clone(), &cfg).await?;
            if cfg.compact_on_shutdown {
                let stats = store.compact()?;
                tracing::info!(
                    "Compacted {:?}: {} -> {} entries",
                    dir,
                    stats.entries_before,
                    stats.entries_after
                );
            }
        }
        None => {
            tracing::warn!("No store directory configured. Positions and buffers are kept in memory.");
            serve(Arc::new(MemoryStore::with_fetch_size(cfg.fetch_size)), &cfg).await?;
        }
    }
    Ok(())
}

/// Feeds stdin through the dispatcher, then drains it.
async fn serve<S>(store: Arc<S>, cfg: &NodeConfig) -> Result<(), NodeError>
where
    S: EventBufferStore + ProcessedEventStore + ParkedEventStore + 'static,
{
    let engine = ConsecutiveEventBuffer::new(store, cfg.component.clone());
    let dispatcher = StreamDispatcher::new(engine, Arc::new(LoggingHandler));
    // Redeliver whatever a previous run left parked.
    dispatcher.retry_parked()?;

    let interrupted = CancellationToken::new();
    {
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, stopping input");
                interrupted.cancel();
            }
        });
    }

    tokio::select! {
        summary = ingest_lines(BufReader::new(tokio::io::stdin()), &dispatcher) => {
            let summary = summary?;
            tracing::info!(
                "Input finished: {} dispatched, {} rejected",
                summary.dispatched,
                summary.rejected
            );
        }
        _ = interrupted.cancelled() => {
            tracing::warn!("Input interrupted");
        }
    }

    match dispatcher.shutdown(cfg.drain_timeout).await? {
        WaitOutcome::Drained => tracing::info!("All streams drained"),
        outcome => tracing::warn!(
            "Shutdown {:?} with {} stream(s) still in progress",
            outcome,
            dispatcher.in_progress()
        ),
    }
    tracing::debug!("Final metrics:\n{}", render_metrics());
    Ok(())
}
