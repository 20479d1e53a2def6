// src/core/stream/log.rs

//! The in-memory append-only log backing the durable delivery path, with
//! consumer-group bookkeeping (last-delivered cursor and per-group pending
//! entry list).

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

// --- Entry ID ---

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Default, Serialize, Deserialize,
)]
pub struct StreamId {
    pub timestamp_ms: u64,
    pub sequence: u64,
}

impl StreamId {
    pub fn new(timestamp_ms: u64, sequence: u64) -> Self {
        Self {
            timestamp_ms,
            sequence,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StreamIdParseError(&'static str);

impl fmt::Display for StreamIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = StreamIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "0" {
            return Ok(StreamId::new(0, 0));
        }
        let parts: Vec<&str> = s.split('-').collect();
        match parts.len() {
            1 => {
                let timestamp_ms = parts[0]
                    .parse()
                    .map_err(|_| StreamIdParseError("Invalid timestamp"))?;
                Ok(StreamId::new(timestamp_ms, 0))
            }
            2 => {
                let timestamp_ms = parts[0]
                    .parse()
                    .map_err(|_| StreamIdParseError("Invalid timestamp"))?;
                let sequence = parts[1]
                    .parse()
                    .map_err(|_| StreamIdParseError("Invalid sequence"))?;
                Ok(StreamId::new(timestamp_ms, sequence))
            }
            _ => Err(StreamIdParseError("Invalid stream ID format")),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.timestamp_ms, self.sequence)
    }
}

// --- Entry ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: IndexMap<Bytes, Bytes>,
}

impl StreamEntry {
    /// Convenience accessor for the envelope payload field.
    pub fn payload(&self) -> Option<&Bytes> {
        self.fields.get("payload".as_bytes())
    }
}

// --- Consumer & group state ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntryInfo {
    pub consumer_name: Bytes,
    pub delivery_count: u64,
    pub delivery_time_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumer {
    pub name: Bytes,
    pub seen_time_ms: u64,
    pub pending_ids: BTreeSet<StreamId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerGroup {
    pub name: Bytes,
    pub last_delivered_id: StreamId,
    pub consumers: HashMap<Bytes, Consumer>,
    pub pending_entries: BTreeMap<StreamId, PendingEntryInfo>,
}

impl ConsumerGroup {
    pub fn new(name: Bytes, last_delivered_id: StreamId) -> Self {
        Self {
            name,
            last_delivered_id,
            consumers: HashMap::new(),
            pending_entries: BTreeMap::new(),
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// --- Main log struct ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamLog {
    pub entries: BTreeMap<StreamId, StreamEntry>,
    pub length: u64,
    pub last_generated_id: StreamId,
    pub groups: HashMap<Bytes, ConsumerGroup>,
    pub maxlen: Option<usize>,
}

impl Default for StreamLog {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            length: 0,
            last_generated_id: StreamId::default(),
            groups: HashMap::new(),
            maxlen: None,
        }
    }
}

impl StreamLog {
    pub fn new(maxlen: Option<usize>) -> Self {
        Self {
            maxlen,
            ..Default::default()
        }
    }

    /// Appends an entry with an auto-generated, strictly increasing id.
    pub fn add_entry(&mut self, fields: IndexMap<Bytes, Bytes>) -> StreamId {
        let mut timestamp_ms = now_ms();
        if timestamp_ms <= self.last_generated_id.timestamp_ms {
            timestamp_ms = self.last_generated_id.timestamp_ms;
        }
        let sequence = if timestamp_ms == self.last_generated_id.timestamp_ms {
            self.last_generated_id.sequence + 1
        } else {
            0
        };
        let new_id = StreamId::new(timestamp_ms, sequence);

        self.entries.insert(new_id, StreamEntry { id: new_id, fields });
        self.last_generated_id = new_id;
        self.length += 1;
        self.trim();
        new_id
    }

    /// Drops the oldest entries past `maxlen`. Trimmed entries may still have
    /// pending-list references; those are dropped lazily on claim.
    pub fn trim(&mut self) {
        if let Some(maxlen) = self.maxlen {
            while self.length as usize > maxlen {
                if let Some(key) = self.entries.keys().next().cloned() {
                    self.entries.remove(&key);
                    self.length -= 1;
                } else {
                    break;
                }
            }
        }
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Entries strictly after `after`, oldest first, up to `count`.
    pub fn entries_after(&self, after: StreamId, count: usize) -> Vec<StreamEntry> {
        use std::ops::Bound;
        self.entries
            .range((Bound::Excluded(after), Bound::Unbounded))
            .take(count)
            .map(|(_, e)| e.clone())
            .collect()
    }
}
