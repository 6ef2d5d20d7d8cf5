#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! scribe library — chat-room archival as reusable building blocks.
//!
//! The key pieces:
//! - `logfmt` — the machine-readable log line codec and the shared logger
//! - `store` — the pluggable message store (in-memory and SQLite)
//! - `recover` — replay of prior log files into a store
//! - `scheduler` — the timer queue serializing all engine work
//! - `client` — WebSocket connection plumbing
//! - `bot` — room identity and nickname state
//! - `scribe` — the log-gossip protocol engine

pub mod bot;
pub mod client;
pub mod config;
pub mod logfmt;
pub mod recover;
pub mod scheduler;
pub mod scribe;
pub mod store;

// Re-export key types at crate root for convenience.
pub use config::ScribeConfig;
pub use logfmt::Logger;
pub use scribe::{Scribe, ScribeError, ShutdownHandle, Task};
pub use store::{LogEntry, LogStore, MemoryStore, MsgId, SqliteStore};

/// Version announced in the `SCRIBE` startup line. The recovery loader
/// compares producer versions against v1.2 to decide whether legacy
/// `MESSAGE` frames should be mined.
pub const VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));
