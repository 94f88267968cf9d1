use event_buffer::BufferError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Invalid magic bytes in header")]
    InvalidMagic,
    #[error("Unsupported log format version {0}")]
    UnsupportedVersion(u32),
    #[error("Checksum mismatch at offset {offset}: expected {expected}, found {found}")]
    ChecksumMismatch {
        offset: u64,
        expected: u64,
        found: u64,
    },
    #[error("Corrupt entry frame at offset {offset} (declared length {payload_len})")]
    CorruptFrame { offset: u64, payload_len: u32 },
    #[error("Truncated entry at offset {offset}")]
    Truncated { offset: u64 },
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Log writer poisoned by an earlier failure")]
    Poisoned,
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl From<PersistenceError> for BufferError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Buffer(inner) => inner,
            other => BufferError::persistence(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
