// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Event envelope and stream identity.
//!
//! A stream is addressed by [`StreamKey`]: the stream id, the source that
//! published it and the consuming component. Positions, buffered rows and
//! status markers are all partitioned by this one key.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::error::{BufferError, Result};

/// Component name used when none is configured.
pub const DEFAULT_COMPONENT: &str = "EVENT_LISTENER";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub stream_id: Uuid,
    pub source: String,
    pub component: String,
}

impl StreamKey {
    pub fn new(stream_id: Uuid, source: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            stream_id,
            source: source.into(),
            component: component.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.stream_id, self.source, self.component)
    }
}

/// An event as delivered by the event source.
///
/// `stream_id` and `version` are optional on the wire; the ordering engine
/// rejects events missing either. `event_number`/`previous_event_number`
/// are the global positions in the event log, when the publisher knows them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub stream_id: Option<Uuid>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub event_number: Option<u64>,
    #[serde(default)]
    pub previous_event_number: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(name: impl Into<String>, stream_id: Uuid, version: i64) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            name: name.into(),
            stream_id: Some(stream_id),
            version: Some(version),
            source: None,
            event_number: None,
            previous_event_number: None,
            payload: Value::Null,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_event_number(mut self, previous: u64, current: u64) -> Self {
        self.previous_event_number = Some(previous);
        self.event_number = Some(current);
        self
    }

    /// Explicit source, else the name prefix before the first '.'.
    pub fn resolved_source(&self) -> &str {
        match &self.source {
            Some(source) if !source.is_empty() => source,
            _ => self.name.split('.').next().unwrap_or(&self.name),
        }
    }

    /// Validates stream id and version and returns the ordering key.
    pub fn ordering_key(&self, component: &str) -> Result<(StreamKey, i64)> {
        let stream_id = self.stream_id.ok_or_else(|| BufferError::MissingStreamId {
            name: self.name.clone(),
        })?;

        let version = match self.version {
            Some(v) if v >= 1 => v,
            other => {
                return Err(BufferError::InvalidVersion {
                    name: self.name.clone(),
                    version: other,
                })
            }
        };

        Ok((
            StreamKey::new(stream_id, self.resolved_source(), component),
            version,
        ))
    }
}
