//! Journal entry format.
//!
//! Entries are appended to the log device as:
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The checksum covers header and payload. The payload holds the entry's
//! sequence number, the oldest sequence still needed when it was written,
//! the devices it landed on, the inodes it touches and its keys.

use crate::error::{CoreError, CoreResult};
use crate::key::{Key, KeyValue};
use crate::types::{BtreeId, DeviceSet, Pos};
use bytes::Bytes;

/// Magic bytes opening every journal entry.
pub const ENTRY_MAGIC: [u8; 4] = *b"CBJE";

/// Current entry format version.
pub const ENTRY_VERSION: u16 = 1;

const ENTRY_TYPE: u8 = 1;
const HEADER_LEN: usize = 4 + 2 + 1 + 4;
const TRAILER_LEN: usize = 4;

const VALUE_DELETED: u8 = 0;
const VALUE_INLINE: u8 = 1;
const VALUE_EXTENT: u8 = 2;

/// One key logged by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalKey {
    /// Tree the key was inserted into.
    pub btree_id: BtreeId,
    /// The key as inserted.
    pub key: Key,
}

/// A journal entry: every key committed under one sequence number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalEntry {
    /// Sequence number.
    pub seq: u64,
    /// Oldest sequence still needed when this entry was written.
    pub last_seq: u64,
    /// Devices the entry was written to.
    pub devs: DeviceSet,
    /// Inodes touched by the entry's keys.
    pub inodes: Vec<u64>,
    /// Logged keys, in commit order.
    pub keys: Vec<JournalKey>,
}

impl JournalEntry {
    /// Encodes the entry with its envelope.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&self.seq.to_le_bytes());
        payload.extend_from_slice(&self.last_seq.to_le_bytes());
        payload.extend_from_slice(&self.devs.bits().to_le_bytes());

        payload.extend_from_slice(&(self.inodes.len() as u32).to_le_bytes());
        for inode in &self.inodes {
            payload.extend_from_slice(&inode.to_le_bytes());
        }

        payload.extend_from_slice(&(self.keys.len() as u32).to_le_bytes());
        for entry in &self.keys {
            encode_key(&mut payload, entry);
        }

        let mut data = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
        data.extend_from_slice(&ENTRY_MAGIC);
        data.extend_from_slice(&ENTRY_VERSION.to_le_bytes());
        data.push(ENTRY_TYPE);
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&payload);

        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        data
    }
}

fn encode_key(buf: &mut Vec<u8>, entry: &JournalKey) {
    let key = &entry.key;
    buf.push(entry.btree_id.as_u8());
    buf.extend_from_slice(&key.pos.inode.to_le_bytes());
    buf.extend_from_slice(&key.pos.offset.to_le_bytes());
    buf.extend_from_slice(&key.size.to_le_bytes());
    buf.extend_from_slice(&key.version.to_le_bytes());
    match &key.value {
        KeyValue::Deleted => buf.push(VALUE_DELETED),
        KeyValue::Inline(bytes) => {
            buf.push(VALUE_INLINE);
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
        KeyValue::Extent { devs } => {
            buf.push(VALUE_EXTENT);
            buf.extend_from_slice(&devs.bits().to_le_bytes());
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .at
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| CoreError::journal_corruption("unexpected end of payload"))?;
        let bytes = &self.buf[self.at..end];
        self.at = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    fn finished(&self) -> bool {
        self.at == self.buf.len()
    }
}

fn decode_payload(payload: &[u8]) -> CoreResult<JournalEntry> {
    let mut cur = Cursor { buf: payload, at: 0 };
    let seq = cur.u64()?;
    let last_seq = cur.u64()?;
    let devs = DeviceSet::from_bits(cur.u64()?);

    let nr_inodes = cur.u32()? as usize;
    let mut inodes = Vec::with_capacity(nr_inodes.min(1024));
    for _ in 0..nr_inodes {
        inodes.push(cur.u64()?);
    }

    let nr_keys = cur.u32()? as usize;
    let mut keys = Vec::with_capacity(nr_keys.min(1024));
    for _ in 0..nr_keys {
        keys.push(decode_key(&mut cur)?);
    }

    if !cur.finished() {
        return Err(CoreError::journal_corruption(format!(
            "trailing bytes in entry {seq}: decoded {} of {}",
            cur.at,
            payload.len()
        )));
    }
    if last_seq > seq {
        return Err(CoreError::journal_corruption(format!(
            "entry {seq} claims last_seq {last_seq}"
        )));
    }

    Ok(JournalEntry {
        seq,
        last_seq,
        devs,
        inodes,
        keys,
    })
}

fn decode_key(cur: &mut Cursor<'_>) -> CoreResult<JournalKey> {
    let id = cur.u8()?;
    let btree_id = BtreeId::from_u8(id)
        .ok_or_else(|| CoreError::journal_corruption(format!("unknown btree id {id}")))?;
    let pos = Pos::new(cur.u64()?, cur.u64()?);
    let size = cur.u64()?;
    let version = cur.u64()?;
    let value = match cur.u8()? {
        VALUE_DELETED => KeyValue::Deleted,
        VALUE_INLINE => {
            let len = cur.u32()? as usize;
            KeyValue::Inline(Bytes::copy_from_slice(cur.take(len)?))
        }
        VALUE_EXTENT => KeyValue::Extent {
            devs: DeviceSet::from_bits(cur.u64()?),
        },
        other => {
            return Err(CoreError::journal_corruption(format!(
                "unknown value type {other}"
            )))
        }
    };
    if size > pos.offset {
        return Err(CoreError::journal_corruption(format!(
            "key at {pos} has size {size} past the start of its inode"
        )));
    }

    Ok(JournalKey {
        btree_id,
        key: Key {
            pos,
            size,
            version,
            needs_whiteout: false,
            value,
        },
    })
}

/// Result of scanning a log device.
#[derive(Debug, Default)]
pub struct LogScan {
    /// Decoded entries with the offsets they start at.
    pub entries: Vec<(u64, JournalEntry)>,
    /// Length of the valid prefix of the log.
    pub valid_len: u64,
    /// True if bytes past `valid_len` are an incomplete final write.
    pub torn_tail: bool,
}

/// Decodes every entry in `log`.
///
/// An incomplete or checksum-failing record at the very end of the log is a
/// torn write and ends the scan. Damage anywhere else is corruption.
///
/// # Errors
///
/// Returns [`CoreError::JournalCorruption`] or
/// [`CoreError::ChecksumMismatch`] for damage before the final record.
pub fn scan_log(log: &[u8]) -> CoreResult<LogScan> {
    let mut scan = LogScan::default();
    let mut at = 0usize;

    while at < log.len() {
        let rest = &log[at..];
        if rest.len() < HEADER_LEN {
            scan.torn_tail = true;
            break;
        }
        if rest[0..4] != ENTRY_MAGIC {
            return Err(CoreError::journal_corruption(format!("bad magic at offset {at}")));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version != ENTRY_VERSION {
            return Err(CoreError::journal_corruption(format!(
                "unsupported entry version {version} at offset {at}"
            )));
        }
        if rest[6] != ENTRY_TYPE {
            return Err(CoreError::journal_corruption(format!(
                "unknown entry type {} at offset {at}",
                rest[6]
            )));
        }
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total = HEADER_LEN + len + TRAILER_LEN;
        if rest.len() < total {
            scan.torn_tail = true;
            break;
        }

        let body = &rest[..HEADER_LEN + len];
        let crc_bytes = &rest[HEADER_LEN + len..total];
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            if at + total == log.len() {
                scan.torn_tail = true;
                break;
            }
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        let entry = decode_payload(&body[HEADER_LEN..])?;
        if let Some((_, prev)) = scan.entries.last() {
            if entry.seq <= prev.seq {
                return Err(CoreError::journal_corruption(format!(
                    "entry {} follows entry {}",
                    entry.seq, prev.seq
                )));
            }
        }
        scan.entries.push((at as u64, entry));
        at += total;
    }

    scan.valid_len = at as u64;
    Ok(scan)
}
