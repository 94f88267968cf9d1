// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Store mutations.
//!
//! Every write to the store tables is expressed as a `Mutation`. The memory
//! store applies them directly; the durable store appends them to its log
//! first and replays them on open. Same mutations => same tables.

use serde::{Deserialize, Serialize};

use super::{BufferedEvent, ParkedEvent, ProcessedEvent, StreamPosition, StreamStatus};
use crate::envelope::StreamKey;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    UpsertPosition(StreamPosition),

    InsertBuffered(BufferedEvent),

    RemoveBuffered { key: StreamKey, version: i64 },

    /// Position upsert + buffer removal for one released event.
    Release {
        position: StreamPosition,
        consumed_version: i64,
    },

    InsertStatus(StreamStatus),

    SaveProcessed(ProcessedEvent),

    ParkEvent(ParkedEvent),

    UnparkEvent { key: StreamKey, version: i64 },
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::UpsertPosition(_) => "UpsertPosition",
            Mutation::InsertBuffered(_) => "InsertBuffered",
            Mutation::RemoveBuffered { .. } => "RemoveBuffered",
            Mutation::Release { .. } => "Release",
            Mutation::InsertStatus(_) => "InsertStatus",
            Mutation::SaveProcessed(_) => "SaveProcessed",
            Mutation::ParkEvent(_) => "ParkEvent",
            Mutation::UnparkEvent { .. } => "UnparkEvent",
        }
    }
}
