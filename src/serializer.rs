// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Conversion between envelopes and the opaque payload kept in the buffer.

use crate::envelope::EventEnvelope;
use crate::error::{BufferError, Result};

/// Pure conversion used when moving an event into or out of the buffer store.
pub trait EventSerializer: Send + Sync {
    fn serialize(&self, event: &EventEnvelope) -> Result<String>;
    fn deserialize(&self, payload: &str) -> Result<EventEnvelope>;
}

/// JSON representation of the full envelope.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonEventSerializer;

impl EventSerializer for JsonEventSerializer {
    fn serialize(&self, event: &EventEnvelope) -> Result<String> {
        serde_json::to_string(event).map_err(|e| BufferError::Serialization(e.to_string()))
    }

    fn deserialize(&self, payload: &str) -> Result<EventEnvelope> {
        serde_json::from_str(payload).map_err(|e| BufferError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_json_keeps_metadata_and_payload() {
        let event = EventEnvelope::new("ctx.item-added", Uuid::new_v4(), 7)
            .with_source("ctx")
            .with_event_number(41, 42)
            .with_payload(json!({"sku": "A-1", "qty": 3}));

        let encoded = JsonEventSerializer.serialize(&event).unwrap();
        let decoded = JsonEventSerializer.deserialize(&encoded).unwrap();

        assert_eq!(decoded, event);
    }

    #[test]
    fn test_garbage_payload_is_serialization_error() {
        let err = JsonEventSerializer.deserialize("not json").unwrap_err();
        assert!(matches!(err, BufferError::Serialization(_)));
    }
}
