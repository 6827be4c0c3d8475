//! # Queue Snapshot Codec
//!
//! Explicit tagged binary format for crash-recovery persistence of pending
//! queue entries. Deterministic and implementation-stable: magic header
//! `QUEUE1\0\0`, big-endian integers, length-prefixed strings. The only
//! contract is round-trip equality of the entries modulo heap placement.
//!
//! Pure encode/decode, decoupled from the queue itself; corrupted input
//! surfaces as [`SnapshotError`] and the caller decides what to quarantine.

use thiserror::Error;
use uuid::Uuid;

use crate::descriptor::{Method, Priority, RequestDescriptor, RequestId, RetryOverrides};
use crate::queue::QueueEntry;
use std::collections::BTreeMap;
use std::time::Duration;

const MAGIC: &[u8; 8] = b"QUEUE1\0\0";
const ENTRY_TAG: u8 = 0x01;

/// Decode failures. Any of these aborts a restore.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("bad magic header")]
    BadMagic,
    #[error("snapshot truncated")]
    Truncated,
    #[error("unknown entry tag {0:#x}")]
    BadTag(u8),
    #[error("unknown method: {0}")]
    BadMethod(String),
    #[error("unknown priority band {0}")]
    BadPriority(u8),
    #[error("invalid utf-8 in string field")]
    BadUtf8,
}

/// Serializes pending entries to the snapshot byte stream.
pub fn encode(entries: &[QueueEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 * entries.len() + 16);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for entry in entries {
        encode_entry(&mut out, entry);
    }
    out
}

fn encode_entry(out: &mut Vec<u8>, entry: &QueueEntry) {
    let d = &entry.descriptor;
    out.push(ENTRY_TAG);
    out.extend_from_slice(d.id.as_bytes());
    out.extend_from_slice(&d.submitted_at.to_be_bytes());
    out.push(d.priority.band() as u8);
    put_str(out, d.method.as_str());
    put_str(out, &d.url);

    out.extend_from_slice(&(d.headers.len() as u32).to_be_bytes());
    for (k, v) in &d.headers {
        put_str(out, k);
        put_str(out, v);
    }

    match &d.body {
        Some(body) => {
            out.push(1);
            out.extend_from_slice(&(body.len() as u32).to_be_bytes());
            out.extend_from_slice(body);
        }
        None => out.push(0),
    }

    out.extend_from_slice(&entry.attempt.to_be_bytes());
    out.extend_from_slice(&entry.next_eligible_ts.to_be_bytes());
    out.extend_from_slice(&entry.expiry_ts.to_be_bytes());
    out.extend_from_slice(&entry.sequence.to_be_bytes());
    out.extend_from_slice(&(d.timeout.as_millis() as u64).to_be_bytes());

    match &d.cache_key {
        Some(key) => {
            out.push(1);
            put_str(out, key);
        }
        None => out.push(0),
    }

    let flags = u8::from(d.retry.max_retries.is_some())
        | (u8::from(d.retry.base_delay.is_some()) << 1);
    out.push(flags);
    if let Some(n) = d.retry.max_retries {
        out.extend_from_slice(&n.to_be_bytes());
    }
    if let Some(delay) = d.retry.base_delay {
        out.extend_from_slice(&(delay.as_millis() as u64).to_be_bytes());
    }

    out.extend_from_slice(&(d.tags.len() as u32).to_be_bytes());
    for (k, v) in &d.tags {
        put_str(out, k);
        put_str(out, v);
    }

    match &d.partition {
        Some(partition) => {
            out.push(1);
            put_str(out, partition);
        }
        None => out.push(0),
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Deserializes a snapshot byte stream back into queue entries.
pub fn decode(bytes: &[u8]) -> Result<Vec<QueueEntry>, SnapshotError> {
    let mut r = Reader { bytes, pos: 0 };
    if r.take(8)? != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let count = r.u32()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(decode_entry(&mut r)?);
    }
    Ok(entries)
}

fn decode_entry(r: &mut Reader<'_>) -> Result<QueueEntry, SnapshotError> {
    let tag = r.u8()?;
    if tag != ENTRY_TAG {
        return Err(SnapshotError::BadTag(tag));
    }

    let id = RequestId(Uuid::from_bytes(
        r.take(16)?.try_into().map_err(|_| SnapshotError::Truncated)?,
    ));
    let submitted_at = r.i64()?;
    let priority_band = r.u8()?;
    let priority =
        Priority::from_band(priority_band).ok_or(SnapshotError::BadPriority(priority_band))?;
    let method_str = r.string()?;
    let method: Method = method_str
        .parse()
        .map_err(|_| SnapshotError::BadMethod(method_str))?;
    let url = r.string()?;

    let header_count = r.u32()? as usize;
    let mut headers = BTreeMap::new();
    for _ in 0..header_count {
        let k = r.string()?;
        let v = r.string()?;
        headers.insert(k, v);
    }

    let body = if r.u8()? == 1 {
        let len = r.u32()? as usize;
        Some(r.take(len)?.to_vec())
    } else {
        None
    };

    let attempt = r.u32()?;
    let next_eligible_ts = r.i64()?;
    let expiry_ts = r.i64()?;
    let sequence = r.u64()?;
    let timeout = Duration::from_millis(r.u64()?);

    let cache_key = if r.u8()? == 1 { Some(r.string()?) } else { None };

    let flags = r.u8()?;
    let max_retries = if flags & 0b01 != 0 { Some(r.u32()?) } else { None };
    let base_delay = if flags & 0b10 != 0 {
        Some(Duration::from_millis(r.u64()?))
    } else {
        None
    };

    let tag_count = r.u32()? as usize;
    let mut tags = BTreeMap::new();
    for _ in 0..tag_count {
        let k = r.string()?;
        let v = r.string()?;
        tags.insert(k, v);
    }

    let partition = if r.u8()? == 1 { Some(r.string()?) } else { None };

    Ok(QueueEntry {
        descriptor: RequestDescriptor {
            id,
            method,
            url,
            headers,
            body,
            timeout,
            cache_key,
            retry: RetryOverrides {
                max_retries,
                base_delay,
            },
            priority,
            partition,
            submitted_at,
            tags,
        },
        sequence,
        attempt,
        next_eligible_ts,
        expiry_ts,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        if self.pos + n > self.bytes.len() {
            return Err(SnapshotError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, SnapshotError> {
        Ok(u32::from_be_bytes(
            self.take(4)?.try_into().map_err(|_| SnapshotError::Truncated)?,
        ))
    }

    fn u64(&mut self) -> Result<u64, SnapshotError> {
        Ok(u64::from_be_bytes(
            self.take(8)?.try_into().map_err(|_| SnapshotError::Truncated)?,
        ))
    }

    fn i64(&mut self) -> Result<i64, SnapshotError> {
        Ok(i64::from_be_bytes(
            self.take(8)?.try_into().map_err(|_| SnapshotError::Truncated)?,
        ))
    }

    fn string(&mut self) -> Result<String, SnapshotError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SnapshotError::BadUtf8)
    }
}
