//! Recovery of prior archive runs from their log files.
//!
//! The machine-readable log doubles as a durable journal: replaying the
//! `POST`/`LOGPOST`/`DELETE`/`UUID` lines of an earlier run reconstructs
//! the store contents that run held. Legacy producers (before v1.2)
//! recorded raw wire frames under `MESSAGE`; those are mined for sender
//! ids so old entries missing a `from` field can be repaired.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};

use serde_json::Value as Json;

use crate::logfmt::{parse_line, LogLine};
use crate::store::{LogEntry, MsgId, UuidMap};

/// Producer version parsed from a `SCRIBE version=...` line.
///
/// An unparseable or absent version compares lower than everything, which
/// matches the legacy producers that predate the version line.
fn parse_version(s: &str) -> Vec<u64> {
    let s = s.strip_prefix('v').unwrap_or(s);
    let parts: Option<Vec<u64>> = s.split('.').map(|p| p.parse().ok()).collect();
    parts.unwrap_or_default()
}

/// Entries and UUID bindings reconstructed from a log file.
#[derive(Debug, Default)]
pub struct RecoveredLog {
    pub entries: Vec<LogEntry>,
    pub uuids: UuidMap,
}

struct Loader {
    maxlen: Option<usize>,
    version: Vec<u64>,
    entries: Vec<LogEntry>,
    uuids: UuidMap,
    deletions: Vec<MsgId>,
    /// Sender ids mined from legacy MESSAGE frames, keyed by entry id.
    froms: HashMap<MsgId, MsgId>,
}

impl Loader {
    fn new(maxlen: Option<usize>) -> Self {
        Loader {
            maxlen,
            version: Vec::new(),
            entries: Vec::new(),
            uuids: UuidMap::new(),
            deletions: Vec::new(),
            froms: HashMap::new(),
        }
    }

    fn feed(&mut self, line: &LogLine) {
        match line.tag.as_str() {
            "SCRIBE" => {
                self.version = parse_version(line.get_str("version").unwrap_or_default());
            }
            "POST" | "LOGPOST" => self.feed_entry(line),
            "MESSAGE" if self.version < vec![1, 2] => self.feed_legacy_frame(line),
            "DELETE" => {
                if let Some(id) = line.get_str("id").and_then(MsgId::parse) {
                    self.deletions.push(id);
                }
            }
            "UUID" => {
                if let (Some(uid), Some(uuid)) = (
                    line.get_str("id").and_then(MsgId::parse),
                    line.get_str("uuid"),
                ) {
                    self.uuids.insert(uid, uuid.to_string());
                }
            }
            _ => {}
        }
    }

    fn feed_entry(&mut self, line: &LogLine) {
        let Some(id) = line.get_str("id").and_then(MsgId::parse) else {
            return;
        };
        let text = line
            .get_str("text")
            .or_else(|| line.get_str("content"))
            .unwrap_or_default();
        let timestamp = line
            .get("timestamp")
            .and_then(crate::logfmt::Value::as_int)
            .and_then(|t| u64::try_from(t).ok())
            .unwrap_or_else(|| id.timestamp_ms());
        self.entries.push(LogEntry {
            id,
            parent: line.get_str("parent").and_then(MsgId::parse),
            from: line.get_str("from").and_then(MsgId::parse),
            nick: line.get_str("nick").unwrap_or_default().to_string(),
            text: text.to_string(),
            timestamp,
        });
        if let Some(maxlen) = self.maxlen {
            if self.entries.len() >= 2 * maxlen {
                self.truncate();
            }
        }
    }

    fn feed_legacy_frame(&mut self, line: &LogLine) {
        let Some(raw) = line.get_str("content") else {
            return;
        };
        let Ok(msg) = serde_json::from_str::<Json>(raw) else {
            return;
        };
        if !matches!(msg["type"].as_str(), Some("broadcast" | "unicast")) {
            return;
        }
        let Some(msgid) = msg["id"].as_str().and_then(MsgId::parse) else {
            return;
        };
        match msg["data"]["type"].as_str() {
            Some("post") => {
                if let Some(from) = msg["from"].as_str().and_then(MsgId::parse) {
                    self.froms.insert(msgid, from);
                }
            }
            Some("log") => {
                for item in msg["data"]["data"].as_array().into_iter().flatten() {
                    if let (Some(id), Some(from)) = (
                        item["id"].as_str().and_then(MsgId::parse),
                        item["from"].as_str().and_then(MsgId::parse),
                    ) {
                        self.froms.insert(id, from);
                    }
                }
            }
            _ => {}
        }
    }

    fn truncate(&mut self) {
        if !self.deletions.is_empty() {
            let delset: std::collections::HashSet<MsgId> =
                self.deletions.drain(..).collect();
            self.entries.retain(|e| !delset.contains(&e.id));
        }
        self.entries.sort_by_key(|e| e.id);
        if let Some(maxlen) = self.maxlen {
            if self.entries.len() > maxlen {
                let cut = self.entries.len() - maxlen;
                self.entries.drain(..cut);
            }
            while self.uuids.len() > maxlen {
                self.uuids.pop_first();
            }
        }
    }

    fn finish(mut self) -> RecoveredLog {
        self.truncate();
        for entry in &mut self.entries {
            if entry.from.is_none() {
                entry.from = self.froms.get(&entry.id).copied();
            }
        }
        RecoveredLog {
            entries: self.entries,
            uuids: self.uuids,
        }
    }
}

/// Replay a prior log from a line source.
pub fn read_posts<R: BufRead>(src: R, maxlen: Option<usize>) -> io::Result<RecoveredLog> {
    let mut loader = Loader::new(maxlen);
    for line in src.lines() {
        if let Some(parsed) = parse_line(&line?) {
            loader.feed(&parsed);
        }
    }
    Ok(loader.finish())
}

/// Replay a prior log from a file path, with `-` meaning stdin.
pub fn read_posts_path(path: &str, maxlen: Option<usize>) -> io::Result<RecoveredLog> {
    if path == "-" {
        read_posts(io::stdin().lock(), maxlen)
    } else {
        read_posts(BufReader::new(File::open(path)?), maxlen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(text: &str, maxlen: Option<usize>) -> RecoveredLog {
        read_posts(text.as_bytes(), maxlen).unwrap()
    }

    const TS: &str = "[2026-08-01 10:00:00]";

    #[test]
    fn test_replay_with_deletion_and_uuid() {
        let log = format!(
            "{TS} SCRIBE version=v1.3\n\
             {TS} POST id='00000000000000A1' nick='ann' text='one'\n\
             {TS} POST id='00000000000000A2' nick='ben' text='two'\n\
             {TS} DELETE id='00000000000000A1'\n\
             {TS} UUID id='00000000000000U1' uuid='abc'\n\
             {TS} UUID id='0000000000000011' uuid='abc'\n"
        );
        let out = replay(&log, None);
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].id, MsgId::parse("00000000000000A2").unwrap());
        assert_eq!(out.entries[0].text, "two");
        // The first UUID line has a malformed id and is skipped.
        assert_eq!(out.uuids.len(), 1);
        assert_eq!(
            out.uuids.get(&MsgId(0x11)).map(String::as_str),
            Some("abc")
        );
    }

    #[test]
    fn test_unparseable_lines_are_skipped() {
        let log = format!(
            "random garbage\n\
             {TS} POST id='bad hex' text='skipped'\n\
             {TS} POST id='0000000000000400'\n"
        );
        let out = replay(&log, None);
        assert_eq!(out.entries.len(), 1);
        // A missing timestamp derives from the id.
        assert_eq!(out.entries[0].timestamp, 1);
    }

    #[test]
    fn test_content_renames_to_text() {
        let log = format!("{TS} POST id='0000000000000400' content='hello'\n");
        let out = replay(&log, None);
        assert_eq!(out.entries[0].text, "hello");
    }

    #[test]
    fn test_legacy_message_backfills_from() {
        let frame = serde_json::json!({
            "type": "broadcast",
            "id": "0000000000000400",
            "from": "0000000000000123",
            "data": {"type": "post", "text": "x"},
        });
        let log = format!(
            "{TS} MESSAGE content={}\n\
             {TS} POST id='0000000000000400' text='x'\n",
            crate::logfmt::Value::Str(frame.to_string()),
        );
        let out = replay(&log, None);
        assert_eq!(out.entries[0].from, Some(MsgId(0x123)));
    }

    #[test]
    fn test_message_frames_ignored_for_modern_producers() {
        let frame = serde_json::json!({
            "type": "broadcast",
            "id": "0000000000000400",
            "from": "0000000000000123",
            "data": {"type": "post", "text": "x"},
        });
        let log = format!(
            "{TS} SCRIBE version=v1.2\n\
             {TS} MESSAGE content={}\n\
             {TS} POST id='0000000000000400' text='x'\n",
            crate::logfmt::Value::Str(frame.to_string()),
        );
        let out = replay(&log, None);
        assert_eq!(out.entries[0].from, None);
    }

    #[test]
    fn test_legacy_log_frame_mined_for_senders() {
        let frame = serde_json::json!({
            "type": "unicast",
            "id": "0000000000009999",
            "from": "0000000000000001",
            "data": {"type": "log", "data": [
                {"id": "0000000000000400", "from": "0000000000000777"},
            ]},
        });
        let log = format!(
            "{TS} MESSAGE content={}\n\
             {TS} LOGPOST id='0000000000000400' text='x'\n",
            crate::logfmt::Value::Str(frame.to_string()),
        );
        let out = replay(&log, None);
        assert_eq!(out.entries[0].from, Some(MsgId(0x777)));
    }

    #[test]
    fn test_maxlen_keeps_newest_entries_and_largest_uids() {
        let mut log = String::new();
        for n in 1..=6u64 {
            log.push_str(&format!("{TS} POST id='{:016X}' text='t'\n", n));
            log.push_str(&format!("{TS} UUID id='{:016X}' uuid='u{}'\n", n + 0x100, n));
        }
        let out = replay(&log, Some(2));
        assert_eq!(out.entries.iter().map(|e| e.id.0).collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(out.uuids.keys().map(|k| k.0).collect::<Vec<_>>(), vec![0x105, 0x106]);
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!(parse_version("v1.5.5"), vec![1, 5, 5]);
        assert_eq!(parse_version("1.2"), vec![1, 2]);
        assert_eq!(parse_version("nonsense"), Vec::<u64>::new());
        assert!(parse_version("v1.1.9") < vec![1, 2]);
        assert!(parse_version("v1.2") >= vec![1, 2]);
    }
}
