//! Checkpoint file format.
//!
//! ```text
//! 0..4    magic "SIDX"
//! 4..6    format version (BE)
//! 6..8    reserved, zero
//! 8..16   layout identifier
//! 16..24  checkpoint generation
//! 24..32  entry count
//! 32..40  payload length
//! 40..44  CRC32 of payload salted with generation and layout
//! 44..    entries: key_len u32, key, value_len u32, value
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::types::{IndexError, Result};

use super::IoLimit;

pub(crate) type Entries = BTreeMap<Vec<u8>, Vec<u8>>;

const MAGIC: [u8; 4] = *b"SIDX";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 44;
const WRITE_CHUNK: usize = 64 * 1024;

mod header {
    use std::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    pub const RESERVED: Range<usize> = 6..8;
    pub const LAYOUT: Range<usize> = 8..16;
    pub const GENERATION: Range<usize> = 16..24;
    pub const ENTRIES: Range<usize> = 24..32;
    pub const PAYLOAD_LEN: Range<usize> = 32..40;
    pub const CRC32: Range<usize> = 40..44;
}

/// Decoded checkpoint contents.
pub(crate) struct Checkpoint {
    pub generation: u64,
    pub entries: Entries,
}

/// Path of the staging file a checkpoint is written to before the rename.
pub(crate) fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Writes `entries` as generation `generation` and atomically swaps the file
/// into place. Returns the number of bytes written.
pub(crate) fn write_checkpoint(
    path: &Path,
    layout_id: u64,
    generation: u64,
    entries: &Entries,
    limit: IoLimit,
) -> Result<u64> {
    let payload = encode_entries(entries)?;
    let crc = payload_crc32(generation, layout_id, &payload);

    let mut hdr = [0u8; HEADER_LEN];
    hdr[header::MAGIC].copy_from_slice(&MAGIC);
    hdr[header::FORMAT_VERSION].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    hdr[header::LAYOUT].copy_from_slice(&layout_id.to_be_bytes());
    hdr[header::GENERATION].copy_from_slice(&generation.to_be_bytes());
    hdr[header::ENTRIES].copy_from_slice(&(entries.len() as u64).to_be_bytes());
    hdr[header::PAYLOAD_LEN].copy_from_slice(&(payload.len() as u64).to_be_bytes());
    hdr[header::CRC32].copy_from_slice(&crc.to_be_bytes());

    let staging = staging_path(path);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&staging)?;
    let mut throttle = Throttle::new(limit);
    file.write_all(&hdr)?;
    throttle.record(HEADER_LEN);
    for chunk in payload.chunks(WRITE_CHUNK) {
        file.write_all(chunk)?;
        throttle.record(chunk.len());
    }
    file.sync_data()?;
    drop(file);

    fs::rename(&staging, path)?;
    fsync_parent_dir(path)?;
    Ok((HEADER_LEN + payload.len()) as u64)
}

/// Reads and validates the checkpoint at `path`.
pub(crate) fn read_checkpoint(path: &Path, layout_id: u64) -> Result<Checkpoint> {
    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    if buf.len() < HEADER_LEN {
        return Err(IndexError::Corruption("checkpoint header truncated"));
    }
    let hdr = &buf[..HEADER_LEN];
    if hdr[header::MAGIC] != MAGIC {
        return Err(IndexError::Corruption("invalid checkpoint magic"));
    }
    if read_u16(hdr, header::FORMAT_VERSION) != FORMAT_VERSION {
        return Err(IndexError::Corruption(
            "unsupported checkpoint format version",
        ));
    }
    if hdr[header::RESERVED].iter().any(|&b| b != 0) {
        return Err(IndexError::Corruption(
            "checkpoint header reserved bytes not zero",
        ));
    }
    if read_u64(hdr, header::LAYOUT) != layout_id {
        return Err(IndexError::Corruption(
            "checkpoint written by a different key layout",
        ));
    }
    let generation = read_u64(hdr, header::GENERATION);
    let entry_count = read_u64(hdr, header::ENTRIES);
    let payload_len = read_u64(hdr, header::PAYLOAD_LEN) as usize;
    let expected_crc = read_u32(hdr, header::CRC32);
    let payload = &buf[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(IndexError::Corruption("checkpoint payload length mismatch"));
    }
    if payload_crc32(generation, layout_id, payload) != expected_crc {
        return Err(IndexError::Corruption("checkpoint checksum mismatch"));
    }
    let entries = decode_entries(payload)?;
    if entries.len() as u64 != entry_count {
        return Err(IndexError::Corruption("checkpoint entry count mismatch"));
    }
    Ok(Checkpoint {
        generation,
        entries,
    })
}

/// Salted with generation and layout so a payload copied between files or
/// layouts never validates.
fn payload_crc32(generation: u64, layout_id: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&generation.to_be_bytes());
    hasher.update(&layout_id.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn encode_entries(entries: &Entries) -> Result<Vec<u8>> {
    let size: usize = entries.iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
    let mut out = Vec::with_capacity(size);
    for (key, value) in entries {
        write_len(&mut out, key.len())?;
        out.extend_from_slice(key);
        write_len(&mut out, value.len())?;
        out.extend_from_slice(value);
    }
    Ok(out)
}

fn decode_entries(mut payload: &[u8]) -> Result<Entries> {
    let mut entries = Entries::new();
    while !payload.is_empty() {
        let key = take_chunk(&mut payload)?;
        let value = take_chunk(&mut payload)?;
        if entries.insert(key, value).is_some() {
            return Err(IndexError::Corruption("duplicate key in checkpoint"));
        }
    }
    Ok(entries)
}

fn write_len(out: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| IndexError::Invalid("tree entry too large"))?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

fn take_chunk(payload: &mut &[u8]) -> Result<Vec<u8>> {
    if payload.len() < 4 {
        return Err(IndexError::Corruption("checkpoint entry truncated"));
    }
    let len = read_u32(payload, 0..4) as usize;
    let rest = &payload[4..];
    if rest.len() < len {
        return Err(IndexError::Corruption("checkpoint entry truncated"));
    }
    let chunk = rest[..len].to_vec();
    *payload = &rest[len..];
    Ok(chunk)
}

fn read_u16(buf: &[u8], range: Range<usize>) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[range]);
    u16::from_be_bytes(bytes)
}

fn read_u32(buf: &[u8], range: Range<usize>) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[range]);
    u32::from_be_bytes(bytes)
}

fn read_u64(buf: &[u8], range: Range<usize>) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[range]);
    u64::from_be_bytes(bytes)
}

#[cfg(unix)]
fn fsync_parent_dir(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

/// Paces writes so the average rate stays under the configured limit.
struct Throttle {
    bytes_per_second: Option<u64>,
    started: Instant,
    written: u64,
}

impl Throttle {
    fn new(limit: IoLimit) -> Self {
        let bytes_per_second = match limit {
            IoLimit::Unlimited => None,
            IoLimit::BytesPerSecond(rate) => Some(rate.max(1)),
        };
        Self {
            bytes_per_second,
            started: Instant::now(),
            written: 0,
        }
    }

    fn record(&mut self, bytes: usize) {
        let Some(rate) = self.bytes_per_second else {
            return;
        };
        self.written = self.written.saturating_add(bytes as u64);
        let due = Duration::from_secs_f64(self.written as f64 / rate as f64);
        let elapsed = self.started.elapsed();
        if due > elapsed {
            thread::sleep(due - elapsed);
        }
    }
}
