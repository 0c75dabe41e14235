//! Persistence of classified results.
//!
//! The scanner only needs a sequential key/value `put`. Keys sort by address first and
//! capture time second: `octets ++ ':' ++ u64 big-endian unix seconds`. Values are the
//! serialized [`ClassifiedResult`].
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::types::ClassifiedResult;

pub const RECORDS_FILE: &str = "records.log";

/// Destination for persisted records. Only ever driven from one task at a time.
///
/// `put` may block on I/O; the scanner calls it from a context where blocking is allowed.
pub trait ResultSink: Send {
    fn put(&mut self, key: &[u8], value: &[u8]) -> io::Result<()>;
}

pub fn record_key(record: &ClassifiedResult) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + 1 + 8);
    key.extend_from_slice(&record.addr.ip().octets());
    key.push(b':');
    // clamp pre-epoch clocks to zero
    let secs = u64::try_from(record.time.unix_timestamp()).unwrap_or(0);
    key.extend_from_slice(&secs.to_be_bytes());
    key
}

pub fn encode_record(record: &ClassifiedResult) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(record)
}

pub fn decode_record(bytes: &[u8]) -> serde_json::Result<ClassifiedResult> {
    serde_json::from_slice(bytes)
}

/// Append-only record log in a storage directory.
///
/// Entries are framed as `u32 BE key length, key, u32 BE value length, value` and
/// flushed on every `put`.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl RecordStore {
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(RECORDS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every entry stored under `dir`, in write order. A torn trailing entry
    /// from an interrupted write is ignored.
    pub fn read_all(dir: impl AsRef<Path>) -> io::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let file = File::open(dir.as_ref().join(RECORDS_FILE))?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
            let Some(key) = read_frame(&mut reader)? else { break };
            let Some(value) = read_frame(&mut reader)? else { break };
            entries.push((key, value));
        }
        Ok(entries)
    }
}

impl ResultSink for RecordStore {
    fn put(&mut self, key: &[u8], value: &[u8]) -> io::Result<()> {
        write_frame(&mut self.writer, key)?;
        write_frame(&mut self.writer, value)?;
        self.writer.flush()
    }
}

fn write_frame(w: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry larger than 4 GiB"))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(bytes)
}

fn read_frame(r: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match r.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut bytes = vec![0u8; u32::from_be_bytes(len) as usize];
    match r.read_exact(&mut bytes) {
        Ok(()) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Keeps entries in memory, in write order.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl ResultSink for MemoryStore {
    fn put(&mut self, key: &[u8], value: &[u8]) -> io::Result<()> {
        self.entries.push((key.to_vec(), value.to_vec()));
        Ok(())
    }
}
