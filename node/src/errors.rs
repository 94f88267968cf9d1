// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use event_buffer::BufferError;
use event_buffer_persistence::PersistenceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Rejected event: {0}")]
    Buffer(#[from] BufferError),
    #[error("Store error: {0}")]
    Store(#[from] PersistenceError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Dispatcher is shutting down")]
    ShuttingDown,
    #[error("Telemetry error: {0}")]
    Telemetry(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Caller-side problem with the event itself, as opposed to a node failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, NodeError::Buffer(e) if e.is_validation())
    }
}
