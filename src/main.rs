#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # scribe
//!
//! Chat-room archival agent. A Scribe connects to a room URL, records
//! every post flowing through it, gossips with peer Scribes to backfill
//! the history it missed, and serves logs back on request.
//!
//! The machine-readable archive log goes to stdout; diagnostics go to
//! stderr via `tracing` (filterable with `RUST_LOG`).

use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use scribe::logfmt::Value;
use scribe::{
    recover, Logger, LogStore, MemoryStore, Scribe, ScribeConfig, SqliteStore, VERSION,
};

/// Chat-room archival agent.
#[derive(Parser)]
#[command(name = "scribe", version)]
struct Cli {
    /// Keep at most this many entries (in-memory store) and uuid bindings;
    /// for a SQLite store this only caps unbounded queries.
    #[arg(long, value_name = "N")]
    maxlen: Option<usize>,
    /// Persist messages to this SQLite database instead of memory.
    #[arg(long, value_name = "FILE")]
    msgdb: Option<String>,
    /// Replay a prior log file into the store before connecting
    /// (`-` reads stdin). May be repeated.
    #[arg(long, value_name = "FILE")]
    read_file: Vec<String>,
    /// Push a full dump to this peer once identified. May be repeated.
    #[arg(long, value_name = "PEERID")]
    push_logs: Vec<String>,
    /// Close the connection once log gossip finishes.
    #[arg(long)]
    dont_stay: bool,
    /// Never pull history from peers.
    #[arg(long)]
    dont_pull: bool,
    /// Nickname to announce in the room.
    #[arg(long, value_name = "NAME")]
    nick: Option<String>,
    /// Room WebSocket URL.
    url: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Argument errors exit 1; --help and --version exit 0.
            let failed = e.use_stderr();
            let _ = e.print();
            return if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS };
        }
    };

    // Diagnostics go to stderr; stdout is reserved for the archive log.
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let logger = Logger::stdout();
    logger.log(&format!("SCRIBE version={VERSION}"));
    logger.log(&format!(
        "OPENING file={} maxlen={}",
        Value::from(cli.msgdb.clone()),
        Value::from(cli.maxlen)
    ));

    let mut db: Box<dyn LogStore + Send> = match &cli.msgdb {
        None => Box::new(MemoryStore::new(cli.maxlen)),
        Some(path) => Box::new(SqliteStore::new(path, cli.maxlen)),
    };
    if let Err(e) = db.init() {
        logger.log_exception("ERROR", &e);
        logger.log("CRASHED");
        return ExitCode::FAILURE;
    }

    for file in &cli.read_file {
        logger.log(&format!(
            "READING file={} maxlen={}",
            Value::Str(file.clone()),
            Value::from(db.capacity())
        ));
        match recover::read_posts_path(file, db.capacity()) {
            Ok(recovered) => {
                let merged = db
                    .extend(recovered.entries)
                    .and_then(|_| db.extend_uuid(&recovered.uuids));
                if let Err(e) = merged {
                    logger.log_exception("ERROR", &e);
                    logger.log("CRASHED");
                    return ExitCode::FAILURE;
                }
            }
            // A missing or unreadable file is logged and skipped.
            Err(e) => logger.log_exception("ERROR", &e),
        }
    }

    match db.bounds() {
        Ok(bounds) => {
            let (from, to, amount) =
                bounds.map_or((None, None, None), |(f, t, n)| (Some(f), Some(t), Some(n)));
            logger.log(&format!(
                "LOGBOUNDS from={} to={} amount={}",
                Value::from(from.map(|id| id.to_string())),
                Value::from(to.map(|id| id.to_string())),
                Value::from(amount)
            ));
        }
        Err(e) => {
            logger.log_exception("ERROR", &e);
            logger.log("CRASHED");
            return ExitCode::FAILURE;
        }
    }

    let mut config = ScribeConfig::new(cli.url);
    config.maxlen = cli.maxlen;
    config.push_logs = cli.push_logs;
    config.dont_stay = cli.dont_stay;
    config.dont_pull = cli.dont_pull;
    if let Some(nick) = cli.nick {
        config.nickname = Some(nick);
    }

    let mut bot = Scribe::new(config, db, logger.clone());

    // SIGINT/SIGTERM request a clean shutdown: the engine drains its
    // queued work, closes the connection, and run() returns.
    let shutdown = bot.shutdown_handle();
    let signal_logger = logger.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_logger.log("EXITING");
        shutdown.stop();
    });

    info!("scribe v{} starting", env!("CARGO_PKG_VERSION"));
    let result = bot.run().await;
    let closed = bot.store_mut().close();

    match (result, closed) {
        (Ok(()), Ok(())) => ExitCode::SUCCESS,
        (Err(e), _) => {
            logger.log_exception("ERROR", &e);
            logger.log("CRASHED");
            ExitCode::FAILURE
        }
        (Ok(()), Err(e)) => {
            logger.log_exception("ERROR", &e);
            logger.log("CRASHED");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
