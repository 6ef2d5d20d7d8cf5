//! SQLite-backed message store.
//!
//! Ids are stored as the integer value of their hex form; the `parent`
//! column logically references `msgid` but is deliberately unconstrained so
//! orphan replies survive. Disk is cheap, so `maxlen` does not bound
//! storage here; it only serves as the default query limit.

use std::collections::BTreeMap;
use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Bounds, LogEntry, LogStore, MsgId, StoreError};

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS logs (\
    msgid INTEGER PRIMARY KEY,\
    parent INTEGER,\
    sender INTEGER,\
    nick TEXT,\
    text TEXT\
);\
CREATE TABLE IF NOT EXISTS uuid (\
    user INTEGER PRIMARY KEY,\
    uuid TEXT\
);";

pub struct SqliteStore {
    path: PathBuf,
    maxlen: Option<usize>,
    conn: Option<Connection>,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>, maxlen: Option<usize>) -> Self {
        SqliteStore {
            path: path.into(),
            maxlen,
            conn: None,
        }
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or(StoreError::Closed)
    }

    fn wrap_row(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
        let id = MsgId::from_db_key(row.get(0)?);
        Ok(LogEntry {
            id,
            parent: row.get::<_, Option<i64>>(1)?.map(MsgId::from_db_key),
            from: row.get::<_, Option<i64>>(2)?.map(MsgId::from_db_key),
            nick: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            text: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            timestamp: id.timestamp_ms(),
        })
    }

    fn unwrap_entry(entry: &LogEntry) -> (i64, Option<i64>, Option<i64>) {
        (
            entry.id.as_db_key(),
            entry.parent.map(MsgId::as_db_key),
            entry.from.map(MsgId::as_db_key),
        )
    }

    fn contains(&self, id: MsgId) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn()?
            .query_row(
                "SELECT 1 FROM logs WHERE msgid = ?1",
                params![id.as_db_key()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn select(&self, sql: &str, args: &[i64]) -> Result<Vec<LogEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), Self::wrap_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl LogStore for SqliteStore {
    fn init(&mut self) -> Result<(), StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(SCHEMA)?;
        self.conn = Some(conn);
        Ok(())
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn bounds(&self) -> Result<Bounds, StoreError> {
        let (min, max, count): (Option<i64>, Option<i64>, i64) = self.conn()?.query_row(
            "SELECT MIN(msgid), MAX(msgid), COUNT(msgid) FROM logs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(match (min, max) {
            (Some(min), Some(max)) if count > 0 => Some((
                MsgId::from_db_key(min),
                MsgId::from_db_key(max),
                count as usize,
            )),
            _ => None,
        })
    }

    fn get(&self, index: i64) -> Result<Option<LogEntry>, StoreError> {
        let (sql, offset) = if index >= 0 {
            (
                "SELECT msgid, parent, sender, nick, text FROM logs \
                 ORDER BY msgid ASC LIMIT 1 OFFSET ?1",
                index,
            )
        } else {
            (
                "SELECT msgid, parent, sender, nick, text FROM logs \
                 ORDER BY msgid DESC LIMIT 1 OFFSET ?1",
                -index - 1,
            )
        };
        Ok(self
            .conn()?
            .query_row(sql, params![offset], Self::wrap_row)
            .optional()?)
    }

    fn query(
        &self,
        from: Option<MsgId>,
        to: Option<MsgId>,
        amount: Option<usize>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let amount = amount.or(self.maxlen).map(|n| n as i64);
        let mut flip = false;
        let (sql, args): (String, Vec<i64>) = match (from, to) {
            (Some(f), Some(t)) => (
                "SELECT msgid, parent, sender, nick, text FROM logs \
                 WHERE msgid BETWEEN ?1 AND ?2 ORDER BY msgid ASC"
                    .into(),
                vec![f.as_db_key(), t.as_db_key()],
            ),
            (Some(f), None) => match amount {
                Some(n) => (
                    "SELECT msgid, parent, sender, nick, text FROM logs \
                     WHERE msgid >= ?1 ORDER BY msgid ASC LIMIT ?2"
                        .into(),
                    vec![f.as_db_key(), n],
                ),
                None => (
                    "SELECT msgid, parent, sender, nick, text FROM logs \
                     WHERE msgid >= ?1 ORDER BY msgid ASC"
                        .into(),
                    vec![f.as_db_key()],
                ),
            },
            (None, Some(t)) => {
                flip = true;
                match amount {
                    Some(n) => (
                        "SELECT msgid, parent, sender, nick, text FROM logs \
                         WHERE msgid <= ?1 ORDER BY msgid DESC LIMIT ?2"
                            .into(),
                        vec![t.as_db_key(), n],
                    ),
                    None => (
                        "SELECT msgid, parent, sender, nick, text FROM logs \
                         WHERE msgid <= ?1 ORDER BY msgid DESC"
                            .into(),
                        vec![t.as_db_key()],
                    ),
                }
            }
            (None, None) => match amount {
                Some(n) => {
                    flip = true;
                    (
                        "SELECT msgid, parent, sender, nick, text FROM logs \
                         ORDER BY msgid DESC LIMIT ?1"
                            .into(),
                        vec![n],
                    )
                }
                None => (
                    "SELECT msgid, parent, sender, nick, text FROM logs ORDER BY msgid"
                        .into(),
                    vec![],
                ),
            },
        };
        let mut rows = self.select(&sql, &args)?;
        if flip {
            rows.reverse();
        }
        Ok(rows)
    }

    fn extend(&mut self, entries: Vec<LogEntry>) -> Result<Vec<MsgId>, StoreError> {
        let mut added = Vec::new();
        for entry in &entries {
            if !self.contains(entry.id)? && !added.contains(&entry.id) {
                added.push(entry.id);
            }
        }
        added.sort_unstable();
        {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "INSERT OR REPLACE INTO logs (msgid, parent, sender, nick, text) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for entry in &entries {
                let (msgid, parent, sender) = Self::unwrap_entry(entry);
                stmt.execute(params![msgid, parent, sender, entry.nick, entry.text])?;
            }
        }
        Ok(added)
    }

    fn delete(&mut self, ids: &[MsgId]) -> Result<Vec<LogEntry>, StoreError> {
        let mut removed = Vec::new();
        for id in ids {
            let entry = self
                .conn()?
                .query_row(
                    "SELECT msgid, parent, sender, nick, text FROM logs WHERE msgid = ?1",
                    params![id.as_db_key()],
                    Self::wrap_row,
                )
                .optional()?;
            if let Some(entry) = entry {
                removed.push(entry);
            }
            self.conn()?
                .execute("DELETE FROM logs WHERE msgid = ?1", params![id.as_db_key()])?;
        }
        Ok(removed)
    }

    fn append_uuid(&mut self, uid: MsgId, uuid: &str) -> Result<bool, StoreError> {
        let result = self.conn()?.execute(
            "INSERT INTO uuid (user, uuid) VALUES (?1, ?2)",
            params![uid.as_db_key(), uuid],
        );
        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                self.conn()?.execute(
                    "UPDATE uuid SET uuid = ?1 WHERE user = ?2",
                    params![uuid, uid.as_db_key()],
                )?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_uuid(&self, uid: MsgId) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT uuid FROM uuid WHERE user = ?1",
                params![uid.as_db_key()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn query_uuid(
        &self,
        ids: Option<&[MsgId]>,
    ) -> Result<BTreeMap<MsgId, String>, StoreError> {
        let mut out = BTreeMap::new();
        match ids {
            None => {
                let conn = self.conn()?;
                let (sql, args): (&str, Vec<i64>) = match self.maxlen {
                    None => ("SELECT user, uuid FROM uuid ORDER BY user DESC", vec![]),
                    Some(n) => (
                        "SELECT user, uuid FROM uuid ORDER BY user DESC LIMIT ?1",
                        vec![n as i64],
                    ),
                };
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(&args), |row| {
                    Ok((
                        MsgId::from_db_key(row.get(0)?),
                        row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    ))
                })?;
                for row in rows {
                    let (uid, uuid) = row?;
                    out.insert(uid, uuid);
                }
            }
            Some(ids) => {
                for uid in ids {
                    if let Some(uuid) = self.get_uuid(*uid)? {
                        out.insert(*uid, uuid);
                    }
                }
            }
        }
        Ok(out)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.conn = None;
        Ok(())
    }
}
