//! Stream entry IDs and messages

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::error::{HandlerError, InvalidEntryId};

/// Message payload: field name to opaque bytes
pub type Fields = BTreeMap<String, Vec<u8>>;

/// Redis stream entry ID (`<ms>-<seq>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntryId {
    ms: u64,
    seq: u64,
}

impl EntryId {
    pub const MIN: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    pub fn ms(&self) -> u64 {
        self.ms
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The smallest ID strictly greater than this one, `None` for the largest ID
    pub fn next(&self) -> Option<Self> {
        match self.seq.checked_add(1) {
            Some(seq) => Some(Self { ms: self.ms, seq }),
            None => Some(Self {
                ms: self.ms.checked_add(1)?,
                seq: 0,
            }),
        }
    }

    /// Wall-clock time the entry was appended
    pub fn timestamp(&self) -> DateTime<Utc> {
        i64::try_from(self.ms)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_default()
    }
}

impl Ord for EntryId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ms, self.seq).cmp(&(other.ms, other.seq))
    }
}

impl PartialOrd for EntryId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = InvalidEntryId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidEntryId(s.to_string());

        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };

        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl serde::Serialize for EntryId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A stream entry delivered to this consumer
///
/// Immutable once read. A redelivery produces a new `Message` with a
/// higher delivery count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: EntryId,
    payload: Fields,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
}

impl Message {
    pub fn new(id: EntryId, payload: Fields, delivery_count: u32) -> Self {
        Self {
            id,
            payload,
            delivery_count: delivery_count.max(1),
            enqueued_at: id.timestamp(),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn payload(&self) -> &Fields {
        &self.payload
    }

    /// Number of times this entry has been delivered, starting at 1
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.payload.get(name).map(Vec::as_slice)
    }

    /// Field as UTF-8 text, `None` when missing or not valid UTF-8
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Deserialize a JSON-encoded field.
    ///
    /// A missing or undecodable field is a permanent failure.
    pub fn json<T: DeserializeOwned>(&self, name: &str) -> Result<T, HandlerError> {
        let raw = self
            .field(name)
            .ok_or_else(|| HandlerError::permanent(format!("missing field '{}'", name)))?;
        Ok(serde_json::from_slice(raw)?)
    }

    pub(crate) fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count.max(1);
        self
    }
}

/// An entry reclaimed from another consumer's pending list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// The message, with its delivery count after the claim
    pub message: Message,

    /// Consumer that owned the entry before the claim
    pub previous_consumer: String,

    /// Time since the last delivery attempt, observed before the claim
    pub idle: Duration,
}
