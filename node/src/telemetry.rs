// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::errors::NodeError;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const EVENTS_RECEIVED: &str = "event_buffer_events_received_total";
pub const EVENTS_RELEASED: &str = "event_buffer_events_released_total";
pub const EVENTS_REJECTED: &str = "event_buffer_events_rejected_total";
pub const HANDLER_FAILURES: &str = "event_buffer_handler_failures_total";
pub const EVENTS_PARKED: &str = "event_buffer_events_parked_total";
pub const STREAMS_IN_PROGRESS: &str = "event_buffer_streams_in_progress";
pub const DRAIN_WAIT_SECONDS: &str = "event_buffer_drain_wait_seconds";

const DEFAULT_FILTER: &str = "event_buffer=info,event_buffer_persistence=info,event_buffer_node=debug";

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize telemetry (logs + metrics)
pub fn init_telemetry() -> Result<(), NodeError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| NodeError::Telemetry(e.to_string()))?;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| NodeError::Telemetry(e.to_string()))?;
    if PROM_HANDLE.set(handle).is_err() {
        tracing::warn!("Prometheus handle already set. Telemetry re-initialized?");
    }

    metrics::describe_counter!(EVENTS_RECEIVED, "Events accepted for dispatch");
    metrics::describe_counter!(EVENTS_RELEASED, "Events released to the handler in order");
    metrics::describe_counter!(EVENTS_REJECTED, "Events rejected by validation or the store");
    metrics::describe_counter!(HANDLER_FAILURES, "Handler invocations that returned an error");
    metrics::describe_counter!(EVENTS_PARKED, "Released events parked for redelivery");
    metrics::describe_gauge!(STREAMS_IN_PROGRESS, "Streams with queued or running work");
    metrics::describe_histogram!(DRAIN_WAIT_SECONDS, "Time spent waiting for in-progress streams");

    metrics::gauge!(STREAMS_IN_PROGRESS, 0.0);
    Ok(())
}

/// Prometheus text rendering of the current metrics.
pub fn render_metrics() -> String {
    match PROM_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# metrics not initialized".to_string(),
    }
}
