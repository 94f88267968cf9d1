//! Durable storage for the event buffer: a checksummed mutation log and the
//! store that replays it.

pub mod durable;
pub mod error;
pub mod fixtures;
pub mod log;

pub use durable::{load_state, CompactionStats, DurableStore, RecoveryReport, StoreOptions, LOG_FILE};
pub use error::{PersistenceError, Result};
