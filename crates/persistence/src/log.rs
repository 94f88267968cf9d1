//! Append-only mutation log.
//!
//! # Layout
//! ```text
//! [header: 16 bytes][entry][entry]...
//! header = magic "EBUF" | format version u32 | entry count at last compaction u64
//! entry  = payload_len u32 | frame check u32 | crc64(len || payload) u64 | bincode(Mutation)
//! ```
//! The frame check is the low half of `crc64(len)`. It lets the reader tell a
//! corrupted length from a short tail before trusting the length.
//!
//! # Guarantees
//! - An entry is visible only after `sync_data` returns (when syncing is on).
//! - A short read at the tail is reported as [`PersistenceError::Truncated`]
//!   with the offset of the last complete entry, so the caller can cut it off.
//! - A bad frame check, an oversized length or a checksum mismatch is never
//!   skipped and never treated as a tail.
//! - A failed append poisons the writer.

use crate::error::{PersistenceError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc64fast::Digest;
use event_buffer::store::Mutation;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

pub const LOG_MAGIC: [u8; 4] = *b"EBUF";
pub const LOG_FORMAT_VERSION: u32 = 2;
/// Largest payload a single entry may carry.
pub const MAX_ENTRY_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHeader {
    pub magic: [u8; 4],
    pub version: u32,
    /// Entries written by the compaction that produced this file.
    pub base_entries: u64,
}

impl LogHeader {
    pub const SIZE: usize = 4 + 4 + 8;

    pub fn new(base_entries: u64) -> Self {
        Self {
            magic: LOG_MAGIC,
            version: LOG_FORMAT_VERSION,
            base_entries,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_all(&self.magic)?;
        buf.write_u32::<LittleEndian>(self.version)?;
        buf.write_u64::<LittleEndian>(self.base_entries)?;
        Ok(buf)
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != LOG_MAGIC {
            return Err(PersistenceError::InvalidMagic);
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != LOG_FORMAT_VERSION {
            return Err(PersistenceError::UnsupportedVersion(version));
        }
        let base_entries = reader.read_u64::<LittleEndian>()?;
        Ok(Self {
            magic,
            version,
            base_entries,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub payload_len: u32,
    pub frame_check: u32,
    pub checksum: u64,
}

impl EntryHeader {
    pub const SIZE: usize = 4 + 4 + 8;

    fn for_payload(payload: &[u8]) -> Result<Self> {
        let payload_len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_ENTRY_SIZE)
            .ok_or_else(|| {
                PersistenceError::Serialization(format!(
                    "entry of {} bytes is too large",
                    payload.len()
                ))
            })?;
        Ok(Self {
            payload_len,
            frame_check: frame_check(payload_len),
            checksum: checksum(payload_len, payload),
        })
    }
}

pub fn frame_check(payload_len: u32) -> u32 {
    let mut digest = Digest::new();
    digest.write(&payload_len.to_le_bytes());
    digest.sum64() as u32
}

fn checksum(payload_len: u32, payload: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(&payload_len.to_le_bytes());
    digest.write(payload);
    digest.sum64()
}

pub fn encode(mutation: &Mutation) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(mutation, bincode::config::standard())
        .map_err(|e| PersistenceError::Serialization(e.to_string()))
}

pub fn decode(payload: &[u8]) -> Result<Mutation> {
    let (mutation, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())
        .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
    Ok(mutation)
}

/// One complete entry, header included.
fn encode_frame(mutation: &Mutation) -> Result<Vec<u8>> {
    let payload = encode(mutation)?;
    let header = EntryHeader::for_payload(&payload)?;

    let mut frame = Vec::with_capacity(EntryHeader::SIZE + payload.len());
    frame.write_u32::<LittleEndian>(header.payload_len)?;
    frame.write_u32::<LittleEndian>(header.frame_check)?;
    frame.write_u64::<LittleEndian>(header.checksum)?;
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Appends entries to an existing log file.
pub struct LogWriter {
    path: PathBuf,
    file: File,
    sync: bool,
    /// End of the last complete entry.
    len: u64,
    appended: u64,
    poisoned: bool,
}

impl LogWriter {
    /// Creates (or replaces) `path` with a fresh header.
    pub fn create(path: impl AsRef<Path>, base_entries: u64, sync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&LogHeader::new(base_entries).to_bytes()?)?;
        file.sync_data()?;
        Ok(Self {
            path,
            file,
            sync,
            len: LogHeader::SIZE as u64,
            appended: 0,
            poisoned: false,
        })
    }

    /// Opens `path` for appending, cutting it to `valid_len` first.
    pub fn open_append(path: impl AsRef<Path>, valid_len: u64, sync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().write(true).open(&path)?;
        if file.metadata()?.len() != valid_len {
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;
        Ok(Self {
            path,
            file,
            sync,
            len: valid_len,
            appended: 0,
            poisoned: false,
        })
    }

    /// Writes one entry. Any I/O failure poisons the writer: the partial frame
    /// is cut off if possible and every later append returns `Poisoned`.
    pub fn append(&mut self, mutation: &Mutation) -> Result<()> {
        if self.poisoned {
            return Err(PersistenceError::Poisoned);
        }
        let frame = encode_frame(mutation)?;

        if let Err(e) = self.write_frame(&frame) {
            self.poisoned = true;
            error!("Append to {:?} failed at offset {}: {}", self.path, self.len, e);
            self.rollback();
            return Err(e);
        }
        self.len += frame.len() as u64;
        self.appended += 1;
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.file.write_all(frame)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        let len = self.len;
        let cut = self
            .file
            .set_len(len)
            .and_then(|_| self.file.seek(SeekFrom::Start(len)))
            .and_then(|_| self.file.sync_data());
        if let Err(e) = cut {
            warn!("Could not cut partial entry from {:?}: {}", self.path, e);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries appended through this writer.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

pub struct LogEntry {
    /// Byte offset of the entry header.
    pub offset: u64,
    pub mutation: Mutation,
}

/// Iterates the entries of a log file in write order.
pub struct LogReader {
    reader: BufReader<File>,
    header: LogHeader,
    offset: u64,
    done: bool,
}

impl LogReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let header = LogHeader::read_from(&mut reader)?;
        Ok(Self {
            reader,
            header,
            offset: LogHeader::SIZE as u64,
            done: false,
        })
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// End of the last entry read successfully.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_entry(&mut self) -> Result<Option<LogEntry>> {
        let start = self.offset;
        let mut len_bytes = [0u8; 4];
        match read_full(&mut self.reader, &mut len_bytes)? {
            0 => return Ok(None),
            4 => {}
            _ => return Err(PersistenceError::Truncated { offset: start }),
        }
        let payload_len = u32::from_le_bytes(len_bytes);

        let check = match self.reader.read_u32::<LittleEndian>() {
            Ok(check) => check,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(PersistenceError::Truncated { offset: start })
            }
            Err(e) => return Err(e.into()),
        };
        // The length is trusted only once its frame check matches.
        if check != frame_check(payload_len) || payload_len > MAX_ENTRY_SIZE {
            return Err(PersistenceError::CorruptFrame {
                offset: start,
                payload_len,
            });
        }

        let expected = match self.reader.read_u64::<LittleEndian>() {
            Ok(sum) => sum,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(PersistenceError::Truncated { offset: start })
            }
            Err(e) => return Err(e.into()),
        };

        let mut payload = vec![0u8; payload_len as usize];
        if read_full(&mut self.reader, &mut payload)? != payload.len() {
            return Err(PersistenceError::Truncated { offset: start });
        }

        let found = checksum(payload_len, &payload);
        if found != expected {
            return Err(PersistenceError::ChecksumMismatch {
                offset: start,
                expected,
                found,
            });
        }

        let mutation = decode(&payload)?;
        self.offset = start + EntryHeader::SIZE as u64 + payload_len as u64;
        Ok(Some(LogEntry {
            offset: start,
            mutation,
        }))
    }
}

impl Iterator for LogReader {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Like `read_exact`, but reports how many bytes were available.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_buffer::store::StreamPosition;
    use event_buffer::StreamKey;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn upsert(version: i64) -> Mutation {
        Mutation::UpsertPosition(StreamPosition::new(
            StreamKey::new(Uuid::nil(), "ctx", "EVENT_LISTENER"),
            version,
        ))
    }

    #[test]
    fn test_header_layout() {
        let header = LogHeader::new(7);
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), LogHeader::SIZE);
        assert_eq!(&bytes[0..4], b"EBUF");

        let decoded = LogHeader::read_from(&bytes[..]).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = LogHeader::new(0).to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            LogHeader::read_from(&bytes[..]),
            Err(PersistenceError::InvalidMagic)
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = LogHeader::new(0).to_bytes().unwrap();
        bytes[4..8].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            LogHeader::read_from(&bytes[..]),
            Err(PersistenceError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_entries_read_back_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.log");

        let mut writer = LogWriter::create(&path, 0, false).unwrap();
        for v in 1..=3 {
            writer.append(&upsert(v)).unwrap();
        }
        assert_eq!(writer.appended(), 3);

        let entries: Vec<_> = LogReader::open(&path)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].offset, LogHeader::SIZE as u64);
        assert_eq!(entries[2].mutation, upsert(3));
    }

    #[test]
    fn test_torn_tail_reports_last_good_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.log");

        let mut writer = LogWriter::create(&path, 0, false).unwrap();
        writer.append(&upsert(1)).unwrap();
        writer.append(&upsert(2)).unwrap();
        drop(writer);

        let full = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert!(reader.next().unwrap().is_ok());
        let good = reader.offset();
        match reader.next() {
            Some(Err(PersistenceError::Truncated { offset })) => assert_eq!(offset, good),
            other => panic!("expected truncation, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_corrupted_length_is_not_a_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.log");

        let mut writer = LogWriter::create(&path, 0, false).unwrap();
        for v in 1..=3 {
            writer.append(&upsert(v)).unwrap();
        }
        drop(writer);

        let mut reader = LogReader::open(&path).unwrap();
        reader.next().unwrap().unwrap();
        let second = reader.offset() as usize;
        drop(reader);

        // A length that points far past the end of the file.
        let mut data = std::fs::read(&path).unwrap();
        data[second..second + 4].copy_from_slice(&1_000_000u32.to_le_bytes());
        std::fs::write(&path, &data).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert!(reader.next().unwrap().is_ok());
        match reader.next() {
            Some(Err(PersistenceError::CorruptFrame {
                offset,
                payload_len,
            })) => {
                assert_eq!(offset, second as u64);
                assert_eq!(payload_len, 1_000_000);
            }
            other => panic!("expected a corrupt frame, got {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[test]
    fn test_oversized_entry_is_refused() {
        let payload = vec![0u8; MAX_ENTRY_SIZE as usize + 1];
        assert!(matches!(
            EntryHeader::for_payload(&payload),
            Err(PersistenceError::Serialization(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_append_poisons_writer() {
        // Every write to /dev/full fails with ENOSPC.
        let mut writer = LogWriter::open_append("/dev/full", 0, false).unwrap();

        assert!(matches!(
            writer.append(&upsert(1)),
            Err(PersistenceError::IoError(_))
        ));
        assert!(writer.is_poisoned());
        assert!(matches!(
            writer.append(&upsert(2)),
            Err(PersistenceError::Poisoned)
        ));
        assert_eq!(writer.appended(), 0);
    }
}
