//! Bot identity state shared by any client of the room protocol.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::{json, Value as Json};

/// The identity assigned by the backend on connect.
#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    /// Session id; message-id shaped, changes on every reconnect.
    pub id: String,
    /// Stable per-user UUID that survives reconnects.
    pub uuid: String,
}

/// Nickname and identity bookkeeping plus the outgoing sequence counter.
///
/// All mutation happens on the dispatcher task, so no locking is needed;
/// the sequence counter is atomic because it outlives individual
/// connections and defines the per-instance `seq` ordering guarantee.
pub struct BotCore {
    pub nickname: Option<String>,
    pub identity: Option<Identity>,
    sequence: AtomicU64,
}

impl BotCore {
    pub fn new(nickname: Option<String>) -> Self {
        BotCore {
            nickname,
            identity: None,
            sequence: AtomicU64::new(0),
        }
    }

    /// Next value of the strictly increasing `seq` counter (starts at 0).
    pub fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether `peer` is this bot's own session id.
    pub fn is_self(&self, peer: &str) -> bool {
        self.identity.as_ref().is_some_and(|me| me.id == peer)
    }

    /// The `nick` announcement payload, or `None` while the bot is
    /// invisible or not yet identified.
    pub fn nick_payload(&self) -> Option<Json> {
        let nick = self.nickname.as_ref()?;
        let identity = self.identity.as_ref()?;
        Some(json!({"type": "nick", "nick": nick, "uuid": identity.uuid}))
    }
}
