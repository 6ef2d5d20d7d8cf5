//! Scribe configuration.
//!
//! Everything the engine needs is resolved up front into a plain struct
//! with explicit defaults; the CLI in `main.rs` is the only producer.

use std::time::Duration;

/// Default nickname announced in the room.
pub const DEFAULT_NICKNAME: &str = "Scribe";

/// Default keepalive ping interval (45 minutes).
pub const DEFAULT_PING_DELAY: Duration = Duration::from_secs(2700);

/// Runtime configuration for one Scribe instance.
#[derive(Debug, Clone)]
pub struct ScribeConfig {
    /// Room WebSocket URL.
    pub url: String,
    /// Nickname to announce; `None` makes the bot invisible, an empty
    /// string is a visible empty nick.
    pub nickname: Option<String>,
    /// Store capacity (entries and uuid bindings) for bounded stores.
    pub maxlen: Option<usize>,
    /// Peers to push a full dump to once identified.
    pub push_logs: Vec<String>,
    /// Close the connection once log gossip finishes.
    pub dont_stay: bool,
    /// Never pull history from peers.
    pub dont_pull: bool,
    /// Interval between keepalive pings.
    pub ping_delay: Duration,
    /// Optional read timeout; `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
    /// Reconnect when the connection drops or fails to establish.
    pub keepalive: bool,
}

impl ScribeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        ScribeConfig {
            url: url.into(),
            nickname: Some(DEFAULT_NICKNAME.to_string()),
            maxlen: None,
            push_logs: Vec::new(),
            dont_stay: false,
            dont_pull: false,
            ping_delay: DEFAULT_PING_DELAY,
            read_timeout: None,
            keepalive: true,
        }
    }
}
