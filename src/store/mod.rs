//! Message log storage.
//!
//! A [`LogStore`] persists chat posts and the user-to-UUID map. Two
//! implementations exist: [`MemoryStore`] (bounded, merge-on-insert) and
//! [`SqliteStore`] (unbounded on disk). All operations are synchronous and
//! run on the engine dispatcher, so implementations need no interior
//! locking.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A message ID: 64 bits, carried on the wire as uppercase hexadecimal.
///
/// The top 54 bits are milliseconds since the UNIX epoch; the low 10 bits
/// disambiguate messages within the same millisecond. Ordering of the hex
/// strings and of the integer values coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MsgId(pub u64);

impl MsgId {
    /// Parse a hex wire id. Case-insensitive; at most 16 digits.
    pub fn parse(s: &str) -> Option<MsgId> {
        if s.is_empty() || s.len() > 16 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(MsgId)
    }

    /// Milliseconds since the epoch encoded in the id.
    pub fn timestamp_ms(self) -> u64 {
        self.0 >> 10
    }

    /// The i64 bit-pattern used for SQLite storage.
    pub fn as_db_key(self) -> i64 {
        self.0 as i64
    }

    pub fn from_db_key(key: i64) -> MsgId {
        MsgId(key as u64)
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl Serialize for MsgId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MsgId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MsgId::parse(&s).ok_or_else(|| serde::de::Error::custom("invalid message id"))
    }
}

/// One archived chat post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub id: MsgId,
    pub parent: Option<MsgId>,
    #[serde(rename = "from")]
    pub from: Option<MsgId>,
    pub nick: String,
    pub text: String,
    /// Milliseconds since the epoch; normally equal to `id.timestamp_ms()`.
    pub timestamp: u64,
}

impl LogEntry {
    /// Build an entry from an untrusted wire object.
    ///
    /// Returns `None` when the `id` is absent or malformed (known to occur
    /// in the wild); other missing fields fall back to empty / derived
    /// values. A malformed `parent` or `from` degrades to `None`.
    pub fn from_wire(obj: &Json) -> Option<LogEntry> {
        let id = MsgId::parse(obj.get("id")?.as_str()?)?;
        let parent = obj.get("parent").and_then(Json::as_str).and_then(MsgId::parse);
        let from = obj.get("from").and_then(Json::as_str).and_then(MsgId::parse);
        let nick = obj
            .get("nick")
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_string();
        let text = obj
            .get("text")
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_string();
        let timestamp = obj
            .get("timestamp")
            .and_then(Json::as_u64)
            .unwrap_or_else(|| id.timestamp_ms());
        Some(LogEntry {
            id,
            parent,
            from,
            nick,
            text,
            timestamp,
        })
    }

    pub fn to_wire(&self) -> Json {
        serde_json::to_value(self).expect("log entry serialization cannot fail")
    }
}

/// `(min id, max id, entry count)` of a non-empty store.
pub type Bounds = Option<(MsgId, MsgId, usize)>;

/// Mapping from user id to the UUID that survives reconnects.
pub type UuidMap = BTreeMap<MsgId, String>;

/// Storage error. Memory stores never fail; SQLite errors surface here.
#[derive(Debug)]
pub enum StoreError {
    /// The store was used before `init()` or after `close()`.
    Closed,
    Sqlite(rusqlite::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Closed => write!(f, "store is not open"),
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Closed => None,
            StoreError::Sqlite(e) => Some(e),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

/// The pluggable message store.
///
/// `query` semantics: with both bounds the range is inclusive; with only
/// `from`, the first `amount` entries at or above it; with only `to`, the
/// *last* `amount` entries at or below it (result still ascending); with
/// only `amount`, the tail of the store; with nothing, everything (subject
/// to a SQLite store's default limit). Results are always ascending by id.
pub trait LogStore {
    fn init(&mut self) -> Result<(), StoreError>;

    /// Configured capacity, if the store enforces one.
    fn capacity(&self) -> Option<usize>;

    fn bounds(&self) -> Result<Bounds, StoreError>;

    /// Positional access; negative indexes count from the end (-1 = last).
    fn get(&self, index: i64) -> Result<Option<LogEntry>, StoreError>;

    fn query(
        &self,
        from: Option<MsgId>,
        to: Option<MsgId>,
        amount: Option<usize>,
    ) -> Result<Vec<LogEntry>, StoreError>;

    /// Insert one entry; `Ok(true)` iff it was not already present.
    fn append(&mut self, entry: LogEntry) -> Result<bool, StoreError> {
        Ok(!self.extend(vec![entry])?.is_empty())
    }

    /// Merge entries; returns the ids actually inserted, ascending.
    fn extend(&mut self, entries: Vec<LogEntry>) -> Result<Vec<MsgId>, StoreError>;

    /// Remove the given ids; returns the removed entries.
    fn delete(&mut self, ids: &[MsgId]) -> Result<Vec<LogEntry>, StoreError>;

    /// Record a user-to-UUID binding; `Ok(true)` iff the uid was new.
    fn append_uuid(&mut self, uid: MsgId, uuid: &str) -> Result<bool, StoreError>;

    /// Merge a uid-to-UUID map; returns the uids that were new.
    fn extend_uuid(&mut self, map: &UuidMap) -> Result<Vec<MsgId>, StoreError> {
        let mut added = Vec::new();
        for (uid, uuid) in map {
            if self.append_uuid(*uid, uuid)? {
                added.push(*uid);
            }
        }
        Ok(added)
    }

    fn get_uuid(&self, uid: MsgId) -> Result<Option<String>, StoreError>;

    /// Look up UUIDs for the given uids, or dump the whole map.
    fn query_uuid(&self, ids: Option<&[MsgId]>) -> Result<UuidMap, StoreError>;

    fn close(&mut self) -> Result<(), StoreError>;
}
