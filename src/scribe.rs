//! The Scribe protocol engine.
//!
//! A Scribe has two duties: record everything that flows through the room
//! (posts, deletions, user-to-UUID bindings), and backfill the history it
//! missed by gossiping with peer Scribes. The gossip runs in rounds: a
//! broadcast `log-query` solicits `log-info` advertisements, the peer with
//! the earliest history wins a one-second selection window, a `log-request`
//! pulls its logs, and the absorbed delivery either starts another round
//! (something was new) or finishes with a single `log-done` broadcast.
//!
//! Every handler runs on the dispatcher task via the [`EventScheduler`],
//! so the store sees one mutation at a time and deferred work (the
//! selection window, keepalive pings, bulk pushes) is ordinary scheduled
//! state rather than locks.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value as Json};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::bot::{BotCore, Identity};
use crate::client::{self, ClientError};
use crate::config::ScribeConfig;
use crate::logfmt::{Logger, Value};
use crate::scheduler::{EventId, EventScheduler};
use crate::store::{LogEntry, LogStore, MsgId, StoreError, UuidMap};

/// How long a round collects `log-info` advertisements before acting.
const REQUEST_DELAY: Duration = Duration::from_secs(1);

/// Work items flowing through the dispatcher.
#[derive(Debug)]
pub enum Task {
    /// A text frame received from the room.
    Frame(String),
    /// The connection is gone (reader task exited).
    ConnectionClosed,
    /// A configured read timeout elapsed; the connection is being torn
    /// down.
    ReadTimeout(Duration),
    /// Keepalive ping due.
    Ping,
    /// The delayed end of a selection window. Acts only if `token` still
    /// matches the current candidate generation.
    SendRequest { token: u64 },
    /// Send the next queued bulk push.
    PushLogs,
    /// External shutdown request.
    Shutdown,
}

/// Engine-level failure; handler errors are logged and swallowed by the
/// dispatcher, so these mostly surface from `run()` itself.
#[derive(Debug)]
pub enum ScribeError {
    Client(ClientError),
    Store(StoreError),
}

impl fmt::Display for ScribeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScribeError::Client(e) => write!(f, "{e}"),
            ScribeError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ScribeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScribeError::Client(e) => Some(e),
            ScribeError::Store(e) => Some(e),
        }
    }
}

impl From<ClientError> for ScribeError {
    fn from(e: ClientError) -> Self {
        ScribeError::Client(e)
    }
}

impl From<StoreError> for ScribeError {
    fn from(e: StoreError) -> Self {
        ScribeError::Store(e)
    }
}

/// The peer currently winning the selection window of a gossip round.
#[derive(Debug, Clone)]
struct Candidate {
    peer: String,
    /// Earliest id the peer advertised.
    from: MsgId,
    /// Our own earliest id at selection time; the pull requests history up
    /// to this point.
    reqto: Option<MsgId>,
}

/// Handle for requesting a clean engine shutdown from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    sched: EventScheduler<Task>,
    stopping: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
        self.sched.add_now(Task::Shutdown);
    }
}

pub struct Scribe {
    config: ScribeConfig,
    bot: BotCore,
    db: Box<dyn LogStore + Send>,
    sched: EventScheduler<Task>,
    logger: Logger,
    /// Outbound frames; dropping it closes the connection.
    out: Option<mpsc::UnboundedSender<Message>>,
    keepalive: bool,
    push_queue: VecDeque<String>,
    candidate: Option<Candidate>,
    /// Bumped whenever the candidate slot changes; stale delayed sends
    /// compare against it and drop themselves.
    candidate_token: u64,
    logs_done: bool,
    ping_job: Option<EventId>,
    stopping: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

impl Scribe {
    pub fn new(config: ScribeConfig, db: Box<dyn LogStore + Send>, logger: Logger) -> Self {
        let push_queue = config.push_logs.iter().cloned().collect();
        let keepalive = config.keepalive;
        let nickname = config.nickname.clone();
        Scribe {
            config,
            bot: BotCore::new(nickname),
            db,
            sched: EventScheduler::new(),
            logger,
            out: None,
            keepalive,
            push_queue,
            candidate: None,
            candidate_token: 0,
            logs_done: false,
            ping_job: None,
            stopping: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
        }
    }

    pub fn scheduler(&self) -> EventScheduler<Task> {
        self.sched.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sched: self.sched.clone(),
            stopping: Arc::clone(&self.stopping),
            notify: Arc::clone(&self.stop_notify),
        }
    }

    pub fn store(&self) -> &dyn LogStore {
        self.db.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut (dyn LogStore + Send) {
        self.db.as_mut()
    }

    /// Connect, dispatch until the connection dies, and reconnect for as
    /// long as keepalive survives. The reconnect delay starts at zero and
    /// grows by one second per consecutive failure.
    pub async fn run(&mut self) -> Result<(), ScribeError> {
        let mut backoff = 0u64;
        while !self.stopping.load(Ordering::Relaxed) {
            self.logger
                .log(&format!("CONNECT url={}", Value::Str(self.config.url.clone())));
            self.sched.set_forever(true);
            let ws = match client::connect(&self.config.url).await {
                Ok(ws) => ws,
                Err(e) => {
                    self.logger.log_exception("ERROR", &e);
                    if !self.keepalive {
                        self.sched.set_forever(false);
                        return Err(e.into());
                    }
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                        () = self.stop_notify.notified() => {}
                    }
                    backoff += 1;
                    continue;
                }
            };
            backoff = 0;
            let (sink, source) = ws.split();
            let (tx, rx) = mpsc::unbounded_channel();
            client::spawn_writer(sink, rx);
            client::spawn_reader(source, self.sched.clone(), self.config.read_timeout);
            self.out = Some(tx);
            self.on_open();
            self.run_dispatcher().await;
            if !self.keepalive {
                break;
            }
        }
        Ok(())
    }

    /// Drain the scheduler, logging (and surviving) handler errors.
    pub async fn run_dispatcher(&mut self) {
        while let Some(task) = self.sched.next().await {
            if let Err(e) = self.dispatch(task) {
                self.logger.log_exception("ERROR", &e);
            }
        }
    }

    fn dispatch(&mut self, task: Task) -> Result<(), ScribeError> {
        match task {
            Task::Frame(raw) => self.on_frame(&raw),
            Task::ConnectionClosed => {
                self.on_close(!self.keepalive);
                Ok(())
            }
            Task::ReadTimeout(limit) => {
                self.logger.log(&format!(
                    "TIMEOUT reason={}",
                    Value::Str(format!("read timed out after {}s", limit.as_secs()))
                ));
                Ok(())
            }
            Task::Ping => self.on_ping(),
            Task::SendRequest { token } => self.on_send_request(token),
            Task::PushLogs => self.on_push_logs(),
            Task::Shutdown => {
                self.close(true);
                Ok(())
            }
        }
    }

    fn on_open(&mut self) {
        self.logger.log("OPENED");
        // Per-connection gossip state.
        self.logs_done = false;
        self.candidate = None;
        self.candidate_token += 1;
    }

    fn on_close(&mut self, is_final: bool) {
        self.logger.log("CLOSED");
        if let Some(job) = self.ping_job.take() {
            self.sched.cancel(job);
        }
        self.out = None;
        self.sched.set_forever(false);
        debug!("connection closed (final={is_final})");
    }

    /// Close the connection; a final close also stops reconnecting.
    fn close(&mut self, is_final: bool) {
        if is_final {
            self.keepalive = false;
        }
        let was_connected = self.out.take().is_some();
        if !was_connected {
            // No reader task will deliver ConnectionClosed.
            self.sched.set_forever(false);
        }
    }

    fn on_frame(&mut self, raw: &str) -> Result<(), ScribeError> {
        self.logger
            .log(&format!("MESSAGE content={}", Value::Str(raw.to_string())));
        let content: Json = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                debug!("ignoring malformed frame: {e}");
                return Ok(());
            }
        };
        match content["type"].as_str() {
            Some("identity") => self.handle_identity(&content),
            Some("joined") => {
                let data = &content["data"];
                if let (Some(uid), Some(uuid)) = (data["id"].as_str(), data["uuid"].as_str()) {
                    let uid = uid.to_string();
                    let uuid = uuid.to_string();
                    self.process_nick(&uid, None, Some(&uuid))?;
                }
                Ok(())
            }
            Some("unicast" | "broadcast") => {
                let data = content["data"].clone();
                self.on_client_message(&data, &content)
            }
            Some("pong" | "who" | "response" | "left") => Ok(()),
            Some("error") => {
                warn!("backend error frame: {content}");
                Ok(())
            }
            other => {
                debug!("unknown frame type {other:?}");
                Ok(())
            }
        }
    }

    fn handle_identity(&mut self, content: &Json) -> Result<(), ScribeError> {
        let identity: Identity = match serde_json::from_value(content["data"].clone()) {
            Ok(identity) => identity,
            Err(e) => {
                debug!("unusable identity frame: {e}");
                return Ok(());
            }
        };
        self.bot.identity = Some(identity);
        self.send_nick(None)?;
        self.send_broadcast(json!({"type": "who"}), true)?;
        self.sched.add_now(Task::PushLogs);
        if !self.config.dont_pull {
            self.logs_begin()?;
        }
        self.ping_job = Some(self.sched.add(self.config.ping_delay, Task::Ping));
        self.sched.set_forever(false);
        Ok(())
    }

    fn on_client_message(&mut self, data: &Json, content: &Json) -> Result<(), ScribeError> {
        let Some(peer) = content["from"].as_str() else {
            return Ok(());
        };
        let peer = peer.to_string();
        match data["type"].as_str() {
            Some("who") => {
                if !self.bot.is_self(&peer) {
                    self.send_nick(Some(&peer))?;
                }
                Ok(())
            }
            Some("nick") => {
                let nick = data["nick"].as_str().map(str::to_string);
                let uuid = data["uuid"].as_str().map(str::to_string);
                self.process_nick(&peer, nick.as_deref(), uuid.as_deref())
            }
            Some("post") => self.process_post(data, content),
            Some("log-query") => self.process_log_query(&peer),
            Some("log-info") => {
                if self.config.dont_pull {
                    return Ok(());
                }
                self.process_log_info(data, &peer)
            }
            Some("log-request") => self.process_log_request(data, &peer),
            Some("log") => self.process_log(data),
            Some("delete") => {
                let ids: Vec<MsgId> = data["ids"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|id| id.as_str().and_then(MsgId::parse))
                    .collect();
                self.delete_entries(&ids)
            }
            Some("log-inquiry") => {
                if self.logs_done {
                    self.send_unicast(&peer, json!({"type": "log-done"}), true)?;
                }
                Ok(())
            }
            Some("log-done") => {
                if self.config.dont_stay && self.config.dont_pull {
                    self.close(true);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn process_nick(
        &mut self,
        uid: &str,
        nick: Option<&str>,
        uuid: Option<&str>,
    ) -> Result<(), ScribeError> {
        let uuid = uuid.filter(|u| !u.is_empty());
        if let Some(nick) = nick.filter(|n| !n.is_empty()) {
            match uuid {
                Some(uuid) => self.logger.log(&format!(
                    "NICK id={} uuid={} nick={}",
                    Value::Str(uid.to_string()),
                    Value::Str(uuid.to_string()),
                    Value::Str(nick.to_string())
                )),
                None => self.logger.log(&format!(
                    "NICK id={} nick={}",
                    Value::Str(uid.to_string()),
                    Value::Str(nick.to_string())
                )),
            }
        }
        if let Some(uuid) = uuid {
            if let Some(uid) = MsgId::parse(uid) {
                if self.db.append_uuid(uid, uuid)? {
                    self.logger.log(&format!(
                        "UUID id={} uuid={}",
                        Value::Str(uid.to_string()),
                        Value::Str(uuid.to_string())
                    ));
                }
            }
        }
        Ok(())
    }

    fn process_post(&mut self, data: &Json, content: &Json) -> Result<(), ScribeError> {
        let mut post = data.clone();
        post["id"] = content["id"].clone();
        post["from"] = content["from"].clone();
        post["timestamp"] = content["timestamp"].clone();
        self.logger.log(&format!(
            "POST id={} parent={} from={} nick={} text={}",
            json_field(&post, "id"),
            json_field(&post, "parent"),
            json_field(&post, "from"),
            json_field(&post, "nick"),
            json_field(&post, "text")
        ));
        match LogEntry::from_wire(&post) {
            Some(entry) => {
                self.db.append(entry)?;
            }
            None => debug!("dropping post with unusable id"),
        }
        Ok(())
    }

    fn process_log_query(&mut self, peer: &str) -> Result<(), ScribeError> {
        if let Some((min, max, count)) = self.db.bounds()? {
            if !self.bot.is_self(peer) {
                self.send_unicast(
                    peer,
                    json!({
                        "type": "log-info",
                        "from": min.to_string(),
                        "to": max.to_string(),
                        "length": count,
                    }),
                    true,
                )?;
            }
        }
        Ok(())
    }

    fn process_log_info(&mut self, data: &Json, peer: &str) -> Result<(), ScribeError> {
        let Some(from) = data["from"].as_str().and_then(MsgId::parse) else {
            return Ok(());
        };
        let better = match &self.candidate {
            None => true,
            Some(current) => from < current.from,
        };
        if better {
            let reqto = self.db.bounds()?.map(|(min, _, _)| min);
            self.candidate_token += 1;
            self.candidate = Some(Candidate {
                peer: peer.to_string(),
                from,
                reqto,
            });
            let token = self.candidate_token;
            self.sched.add(REQUEST_DELAY, Task::SendRequest { token });
        }
        Ok(())
    }

    fn on_send_request(&mut self, token: u64) -> Result<(), ScribeError> {
        if token != self.candidate_token {
            // A later info (or a newer round) superseded this send.
            return Ok(());
        }
        match self.candidate.clone() {
            None => self.logs_finish(),
            Some(candidate) => {
                let mut request = json!({"type": "log-request"});
                if let Some(reqto) = candidate.reqto {
                    request["to"] = Json::String(reqto.to_string());
                }
                self.send_unicast(&candidate.peer, request, true)?;
                Ok(())
            }
        }
    }

    fn process_log_request(&mut self, data: &Json, peer: &str) -> Result<(), ScribeError> {
        let from = data["from"].as_str().and_then(MsgId::parse);
        let to = data["to"].as_str().and_then(MsgId::parse);
        let amount = data["amount"].as_u64().map(|n| n as usize);
        let logs = self.db.query(from, to, amount)?;
        let senders: Vec<MsgId> = logs.iter().filter_map(|e| e.from).collect();
        let uuids = self.db.query_uuid(Some(&senders))?;
        let key = data.get("key").filter(|k| !k.is_null()).cloned();
        self.send_logs(peer, &logs, &uuids, key)
    }

    fn process_log(&mut self, data: &Json) -> Result<(), ScribeError> {
        let empty = Vec::new();
        let rawlogs = data["data"].as_array().unwrap_or(&empty);
        let uuids = data["uuids"].as_object();
        let (added, uuid_added) = self.process_logs(rawlogs, uuids)?;
        if !self.config.dont_pull {
            if added > 0 || uuid_added > 0 {
                // Someone with even deeper history may still be around.
                self.logs_begin()?;
            } else {
                self.logs_finish()?;
            }
        }
        Ok(())
    }

    /// Merge a gossiped delivery into the store, logging what was new.
    /// Returns the numbers of absorbed entries and uuid bindings.
    fn process_logs(
        &mut self,
        rawlogs: &[Json],
        uuids: Option<&serde_json::Map<String, Json>>,
    ) -> Result<(usize, usize), ScribeError> {
        let mut entries: Vec<LogEntry> = rawlogs.iter().filter_map(LogEntry::from_wire).collect();
        entries.sort_by_key(|e| e.id);
        let added = self.db.extend(entries.clone())?;
        let added_set: HashSet<MsgId> = added.iter().copied().collect();
        for entry in &entries {
            if added_set.contains(&entry.id) {
                self.logger.log(&format!("LOGPOST {}", entry_fields(entry)));
            }
        }
        let mut map = UuidMap::new();
        for (uid, uuid) in uuids.into_iter().flatten() {
            if let (Some(uid), Some(uuid)) = (MsgId::parse(uid), uuid.as_str()) {
                map.insert(uid, uuid.to_string());
            }
        }
        let uuid_added = self.db.extend_uuid(&map)?;
        for uid in &uuid_added {
            if let Some(uuid) = map.get(uid) {
                self.logger.log(&format!(
                    "LOGUUID id={} uuid={}",
                    Value::Str(uid.to_string()),
                    Value::Str(uuid.clone())
                ));
            }
        }
        Ok((added.len(), uuid_added.len()))
    }

    fn delete_entries(&mut self, ids: &[MsgId]) -> Result<(), ScribeError> {
        for entry in self.db.delete(ids)? {
            self.logger.log(&format!("DELETE {}", entry_fields(&entry)));
        }
        Ok(())
    }

    fn on_push_logs(&mut self) -> Result<(), ScribeError> {
        let Some(peer) = self.push_queue.pop_front() else {
            return Ok(());
        };
        let inquire = self.push_queue.is_empty();
        let (from, to) = self
            .db
            .bounds()?
            .map_or((None, None), |(min, max, _)| (Some(min), Some(max)));
        let logs = self.db.query(from, to, None)?;
        let senders: Vec<MsgId> = logs.iter().filter_map(|e| e.from).collect();
        let uuids = self.db.query_uuid(Some(&senders))?;
        self.send_logs(&peer, &logs, &uuids, None)?;
        if inquire {
            self.send_broadcast(json!({"type": "log-inquiry"}), true)?;
        } else {
            self.sched.add_now(Task::PushLogs);
        }
        Ok(())
    }

    /// Start a gossip round: solicit advertisements and schedule the end
    /// of the selection window.
    fn logs_begin(&mut self) -> Result<(), ScribeError> {
        self.candidate = None;
        self.candidate_token += 1;
        self.send_broadcast(json!({"type": "log-query"}), true)?;
        let token = self.candidate_token;
        self.sched.add(REQUEST_DELAY, Task::SendRequest { token });
        Ok(())
    }

    /// Finish gossiping; `log-done` goes out at most once per connection.
    fn logs_finish(&mut self) -> Result<(), ScribeError> {
        if self.logs_done {
            return Ok(());
        }
        self.logs_done = true;
        self.send_broadcast(json!({"type": "log-done"}), true)?;
        if self.config.dont_stay {
            self.close(true);
        }
        Ok(())
    }

    fn on_ping(&mut self) -> Result<(), ScribeError> {
        self.send_seq(json!({"type": "ping"}), true)?;
        self.ping_job = Some(self.sched.add(self.config.ping_delay, Task::Ping));
        Ok(())
    }

    fn send_nick(&mut self, peer: Option<&str>) -> Result<(), ScribeError> {
        if let Some(payload) = self.bot.nick_payload() {
            self.send_to(peer, payload)?;
        }
        Ok(())
    }

    /// Serve a log delivery, logging it as `LOGSEND` instead of the
    /// verbose `SEND` (the payload can be huge).
    fn send_logs(
        &mut self,
        peer: &str,
        logs: &[LogEntry],
        uuids: &UuidMap,
        key: Option<Json>,
    ) -> Result<(), ScribeError> {
        let mut line = format!("LOGSEND to={}", Value::Str(peer.to_string()));
        match (logs.first(), logs.last()) {
            (Some(first), Some(last)) => {
                line.push_str(&format!(
                    " log-from={} log-to={} log-count={}",
                    Value::Str(first.id.to_string()),
                    Value::Str(last.id.to_string()),
                    Value::from(logs.len())
                ));
            }
            _ => line.push_str(" log-count=0"),
        }
        let uuids_wire: serde_json::Map<String, Json> = uuids
            .iter()
            .map(|(uid, uuid)| (uid.to_string(), Json::String(uuid.clone())))
            .collect();
        let mut reply = json!({
            "type": "log",
            "data": logs.iter().map(LogEntry::to_wire).collect::<Vec<_>>(),
            "uuids": uuids_wire,
        });
        if let Some(key) = key {
            line.push_str(&format!(" key={}", json_to_value(&key)));
            reply["key"] = key;
        }
        self.logger.log(&line);
        self.send_unicast(peer, reply, false)?;
        Ok(())
    }

    fn send_raw(&mut self, raw: &str, verbose: bool) -> Result<(), ScribeError> {
        if verbose {
            self.logger
                .log(&format!("SEND content={}", Value::Str(raw.to_string())));
        }
        let out = self.out.as_ref().ok_or(ClientError::NotConnected)?;
        out.send(Message::Text(raw.to_string().into()))
            .map_err(|_| ClientError::NotConnected)?;
        Ok(())
    }

    /// Stamp `content` with the next sequence number and send it.
    fn send_seq(&mut self, mut content: Json, verbose: bool) -> Result<u64, ScribeError> {
        let seq = self.bot.next_seq();
        content["seq"] = Json::from(seq);
        self.send_raw(&content.to_string(), verbose)?;
        Ok(seq)
    }

    fn send_unicast(&mut self, dest: &str, data: Json, verbose: bool) -> Result<u64, ScribeError> {
        self.send_seq(json!({"type": "unicast", "to": dest, "data": data}), verbose)
    }

    fn send_broadcast(&mut self, data: Json, verbose: bool) -> Result<u64, ScribeError> {
        self.send_seq(json!({"type": "broadcast", "data": data}), verbose)
    }

    fn send_to(&mut self, dest: Option<&str>, data: Json) -> Result<u64, ScribeError> {
        match dest {
            Some(dest) => self.send_unicast(dest, data, true),
            None => self.send_broadcast(data, true),
        }
    }
}

fn entry_fields(entry: &LogEntry) -> String {
    format!(
        "id={} parent={} from={} nick={} text={}",
        Value::Str(entry.id.to_string()),
        Value::from(entry.parent.map(|p| p.to_string())),
        Value::from(entry.from.map(|f| f.to_string())),
        Value::Str(entry.nick.clone()),
        Value::Str(entry.text.clone())
    )
}

fn json_field(obj: &Json, key: &str) -> Value {
    obj.get(key).map_or(Value::Null, json_to_value)
}

/// Best-effort mapping of wire JSON into log-line literals.
fn json_to_value(v: &Json) -> Value {
    match v {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or(Value::Null),
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => Value::Tuple(items.iter().map(json_to_value).collect()),
        Json::Object(map) => Value::Dict(
            map.iter()
                .map(|(k, v)| (Value::Str(k.clone()), json_to_value(v)))
                .collect(),
        ),
    }
}
