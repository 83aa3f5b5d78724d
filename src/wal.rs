//! Write-ahead log
//!
//! Logical operations are appended to segment files named
//! `<data-file>.wal.000`, `<data-file>.wal.001`, ... next to the data file.
//! Deriving segment names from the data file's basename keeps databases
//! sharing a directory from seeing each other's logs.
//!
//! Record format (little-endian, no alignment padding):
//!
//! ```text
//! lsn: u64 | txn_id: u64 | op: u8 | reserved: 7 bytes |
//! key_len: u32 | val_len: u32 | timestamp: i64 (Unix seconds) |
//! key bytes | value bytes | crc32: u32 over all prior bytes
//! ```
//!
//! A segment rotates once a write would push it past the size limit; files
//! beyond the retention count are evicted on rotation and on checkpoint.
//! Appends are serialized with an internal mutex because the background
//! checkpointer writes its own records concurrently with the committer.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Lsn, Result, TxnId};

/// Fixed header bytes before the key
pub const WAL_HEADER_SIZE: usize = 40;

const CRC_SIZE: usize = 4;

/// Largest key/value length accepted when decoding, a plausibility bound
/// against garbage headers
const MAX_DECODE_LEN: u32 = 1 << 20;

/// Default segment size limit (100 MiB)
pub const DEFAULT_WAL_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Default number of retained segments
pub const DEFAULT_WAL_RETAINED_FILES: usize = 3;

/// Logical operation kinds carried by the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    /// Key inserted or updated
    Insert = 1,
    /// Key deleted
    Delete = 2,
    /// Transaction commit marker
    Commit = 3,
    /// Checkpoint marker
    Checkpoint = 4,
}

impl WalOp {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(WalOp::Insert),
            2 => Some(WalOp::Delete),
            3 => Some(WalOp::Commit),
            4 => Some(WalOp::Checkpoint),
            _ => None,
        }
    }
}

/// A decoded log record
#[derive(Debug, Clone)]
pub struct WalEntry {
    /// Log sequence number
    pub lsn: Lsn,
    /// Owning transaction (0 for checkpoints)
    pub txn_id: TxnId,
    /// Operation kind
    pub op: WalOp,
    /// Key bytes (empty for commit/checkpoint)
    pub key: Vec<u8>,
    /// Value bytes (empty except for inserts)
    pub value: Vec<u8>,
    /// Wall clock at write, Unix seconds
    pub timestamp: i64,
}

impl WalEntry {
    /// Serialize with the trailing CRC
    pub fn encode(&self) -> Vec<u8> {
        let total = WAL_HEADER_SIZE + self.key.len() + self.value.len() + CRC_SIZE;
        let mut buf = vec![0u8; total];
        LittleEndian::write_u64(&mut buf[0..8], self.lsn);
        LittleEndian::write_u64(&mut buf[8..16], self.txn_id);
        buf[16] = self.op as u8;
        // bytes 17..24 reserved
        LittleEndian::write_u32(&mut buf[24..28], self.key.len() as u32);
        LittleEndian::write_u32(&mut buf[28..32], self.value.len() as u32);
        LittleEndian::write_i64(&mut buf[32..40], self.timestamp);
        let key_end = WAL_HEADER_SIZE + self.key.len();
        buf[WAL_HEADER_SIZE..key_end].copy_from_slice(&self.key);
        buf[key_end..key_end + self.value.len()].copy_from_slice(&self.value);
        let crc = crc32fast::hash(&buf[..total - CRC_SIZE]);
        LittleEndian::write_u32(&mut buf[total - CRC_SIZE..], crc);
        buf
    }

    /// Decode one record from the front of `buf`, returning it with its
    /// encoded length. `None` means no CRC-valid record starts here.
    pub fn decode(buf: &[u8]) -> Option<(WalEntry, usize)> {
        if buf.len() < WAL_HEADER_SIZE + CRC_SIZE {
            return None;
        }
        let op = WalOp::from_u8(buf[16])?;
        let key_len = LittleEndian::read_u32(&buf[24..28]);
        let val_len = LittleEndian::read_u32(&buf[28..32]);
        if key_len > MAX_DECODE_LEN || val_len > MAX_DECODE_LEN {
            return None;
        }
        let total = WAL_HEADER_SIZE + key_len as usize + val_len as usize + CRC_SIZE;
        if buf.len() < total {
            return None;
        }
        let stored = LittleEndian::read_u32(&buf[total - CRC_SIZE..total]);
        if crc32fast::hash(&buf[..total - CRC_SIZE]) != stored {
            return None;
        }
        let key_end = WAL_HEADER_SIZE + key_len as usize;
        Some((
            WalEntry {
                lsn: LittleEndian::read_u64(&buf[0..8]),
                txn_id: LittleEndian::read_u64(&buf[8..16]),
                op,
                key: buf[WAL_HEADER_SIZE..key_end].to_vec(),
                value: buf[key_end..key_end + val_len as usize].to_vec(),
                timestamp: LittleEndian::read_i64(&buf[32..40]),
            },
            total,
        ))
    }
}

struct WalInner {
    file: File,
    index: u32,
    size: u64,
}

/// Append-only log over rotating segment files
pub struct Wal {
    dir: PathBuf,
    /// Segment basename, `<data-file-name>.wal`
    base: String,
    max_file_size: u64,
    retained: usize,
    next_lsn: AtomicU64,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Open the log beside the data file at `data_path`, scanning existing
    /// segments to seed the LSN counter.
    pub fn open(data_path: &Path, max_file_size: u64, retained: usize) -> Result<Wal> {
        let dir = data_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = data_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(Error::InvalidParameter("database path has no file name"))?;
        let base = format!("{}.wal", name);

        let segments = find_segments_in(&dir, &base)?;
        let mut max_lsn = 0u64;
        for (_, path) in &segments {
            for entry in decode_segment_file(path, true)? {
                max_lsn = max_lsn.max(entry.lsn);
            }
        }

        let index = segments.last().map(|(i, _)| *i).unwrap_or(0);
        let path = dir.join(segment_name(&base, index));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Io(format!("open wal segment {}: {}", path.display(), e)))?;
        let size = file.metadata().map_err(|e| Error::Io(e.to_string()))?.len();

        Ok(Wal {
            dir,
            base,
            max_file_size,
            retained: retained.max(1),
            next_lsn: AtomicU64::new(max_lsn + 1),
            inner: Mutex::new(WalInner { file, index, size }),
        })
    }

    /// Append one record, rotating the segment first when it is full.
    /// Returns the assigned LSN.
    pub fn append(&self, txn_id: TxnId, op: WalOp, key: &[u8], value: &[u8]) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        // Assigned under the lock so file order matches LSN order.
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let entry = WalEntry {
            lsn,
            txn_id,
            op,
            key: key.to_vec(),
            value: value.to_vec(),
            timestamp: unix_now(),
        };
        let encoded = entry.encode();

        if inner.size > 0 && inner.size + encoded.len() as u64 > self.max_file_size {
            self.rotate(&mut inner)?;
        }
        inner
            .file
            .write_all(&encoded)
            .map_err(|e| Error::Io(format!("wal append: {}", e)))?;
        inner.size += encoded.len() as u64;
        Ok(lsn)
    }

    /// Flush appended records to disk
    pub fn fsync(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner
            .file
            .sync_all()
            .map_err(|e| Error::Io(format!("wal fsync: {}", e)))
    }

    fn rotate(&self, inner: &mut WalInner) -> Result<()> {
        inner
            .file
            .sync_all()
            .map_err(|e| Error::Io(format!("wal fsync: {}", e)))?;
        let next_index = inner.index + 1;
        let path = self.dir.join(segment_name(&self.base, next_index));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Io(format!("open wal segment {}: {}", path.display(), e)))?;
        debug!(segment = %path.display(), "rotated wal segment");
        inner.file = file;
        inner.index = next_index;
        inner.size = 0;
        self.evict_old()?;
        Ok(())
    }

    /// Delete every segment older than the newest `retained`
    pub fn truncate_old(&self) -> Result<()> {
        // Hold the append lock so rotation cannot race the directory scan.
        let _inner = self.inner.lock();
        self.evict_old()
    }

    fn evict_old(&self) -> Result<()> {
        let segments = self.find_segments()?;
        if segments.len() <= self.retained {
            return Ok(());
        }
        for (_, path) in &segments[..segments.len() - self.retained] {
            std::fs::remove_file(path)
                .map_err(|e| Error::Io(format!("evict {}: {}", path.display(), e)))?;
            debug!(segment = %path.display(), "evicted wal segment");
        }
        Ok(())
    }

    /// Enumerate this database's segments in index order
    pub fn find_segments(&self) -> Result<Vec<(u32, PathBuf)>> {
        find_segments_in(&self.dir, &self.base)
    }

    /// Decode every record of every segment in index order, skipping over
    /// corrupted regions.
    pub fn read_entries(&self) -> Result<Vec<WalEntry>> {
        let segments = self.find_segments()?;
        let mut entries = Vec::new();
        for (pos, (_, path)) in segments.iter().enumerate() {
            let is_last = pos + 1 == segments.len();
            entries.extend(decode_segment_file(path, is_last)?);
        }
        Ok(entries)
    }
}

fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

fn segment_name(base: &str, index: u32) -> String {
    format!("{}.{:03}", base, index)
}

fn find_segments_in(dir: &Path, base: &str) -> Result<Vec<(u32, PathBuf)>> {
    let mut segments = Vec::new();
    let read = match std::fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(segments),
        Err(e) => return Err(Error::Io(format!("read dir {}: {}", dir.display(), e))),
    };
    let prefix = format!("{}.", base);
    for entry in read {
        let entry = entry.map_err(|e| Error::Io(e.to_string()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name.strip_prefix(&prefix) else { continue };
        if suffix.len() >= 3 && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = suffix.parse::<u32>() {
                segments.push((index, entry.path()));
            }
        }
    }
    segments.sort_by_key(|(i, _)| *i);
    Ok(segments)
}

/// Decode a whole segment, resynchronizing past corrupted regions.
///
/// On a failed decode the scan advances one byte at a time until another
/// CRC-valid record is found; the skipped range is logged. An undecodable
/// tail is a normal crash artifact in the newest segment and a corruption
/// signal elsewhere.
fn decode_segment_file(path: &Path, is_last: bool) -> Result<Vec<WalEntry>> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Io(format!("read wal segment {}: {}", path.display(), e)))?;
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        if let Some((entry, used)) = WalEntry::decode(&bytes[pos..]) {
            entries.push(entry);
            pos += used;
            continue;
        }
        // Resynchronize: look for the next offset that decodes cleanly.
        let mut probe = pos + 1;
        let found = loop {
            if probe >= bytes.len() {
                break None;
            }
            if WalEntry::decode(&bytes[probe..]).is_some() {
                break Some(probe);
            }
            probe += 1;
        };
        match found {
            Some(next) => {
                warn!(
                    segment = %path.display(),
                    start = pos,
                    skipped = next - pos,
                    "skipped corrupted wal region"
                );
                pos = next;
            }
            None => {
                if is_last {
                    debug!(
                        segment = %path.display(),
                        offset = pos,
                        "ignoring truncated record at wal tail"
                    );
                } else {
                    warn!(
                        segment = %path.display(),
                        offset = pos,
                        "undecodable tail in non-final wal segment"
                    );
                }
                break;
            }
        }
    }
    Ok(entries)
}
