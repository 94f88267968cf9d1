// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Downstream consumer of released events.

use event_buffer::EventEnvelope;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Receives events for one stream strictly in version order.
///
/// Runs on a blocking thread. An error stops the current batch; events still
/// in the buffer are released again on the next arrival for that stream.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&EventEnvelope) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        self(event)
    }
}

/// Logs each released event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        info!(
            name = %event.name,
            stream_id = ?event.stream_id,
            version = ?event.version,
            source = event.resolved_source(),
            "Event released"
        );
        Ok(())
    }
}
