// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Error types.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BufferError {
    /// The event carries no stream identifier.
    #[error("Event '{name}' has no stream id")]
    MissingStreamId { name: String },

    /// Versions are 1-based; absent or < 1 is rejected.
    #[error("Event '{name}' has invalid version {version:?}")]
    InvalidVersion { name: String, version: Option<i64> },

    /// A row already exists for (stream, version, source, component).
    #[error("Buffered event already exists: stream={stream_id}, version={version}, source={event_source}, component={component}")]
    DuplicateBufferEntry {
        stream_id: Uuid,
        version: i64,
        event_source: String,
        component: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Persistence error: {0}")]
    Persistence(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl BufferError {
    pub fn persistence<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BufferError::Persistence(Box::new(err))
    }

    /// Validation errors are caller errors and are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BufferError::MissingStreamId { .. } | BufferError::InvalidVersion { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BufferError>;
