// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.

//! event-buffer: per-stream ordering and buffering for event-sourced consumers.
//!
//! Events for one stream may arrive out of order (replay, catch-up, several
//! publishers). The [`ConsecutiveEventBuffer`] releases them strictly by
//! version, holding early arrivals in a persisted buffer until the gap closes.

pub mod envelope;
pub mod error;
pub mod in_progress;
pub mod ordering;
pub mod position;
pub mod serializer;
pub mod store;

#[cfg(test)]
pub mod tests;

pub use envelope::{EventEnvelope, StreamKey, DEFAULT_COMPONENT};
pub use error::{BufferError, Result};
pub use in_progress::{InProgressGuard, InProgressStreams, StreamToken, WaitOutcome};
pub use ordering::{ConsecutiveEventBuffer, Disposition, OrderedEvents};
pub use position::PositionInitializer;
pub use serializer::{EventSerializer, JsonEventSerializer};
