//! End-to-end log-gossip tests against an in-process room backend.
//!
//! The backend here is a minimal stand-in for the real chat server: it
//! assigns identities, stamps envelopes, and routes `broadcast`/`unicast`
//! frames between connected clients (echoing broadcasts back to the
//! sender, as the real backend does). Everything else is the production
//! engine talking over real WebSockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value as Json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;

use scribe::{LogEntry, LogStore, Logger, MemoryStore, MsgId, Scribe, ScribeConfig};

type Clients = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>>;

struct Room {
    url: String,
    /// `(sender id, client payload)` for every routed client message.
    events: mpsc::UnboundedReceiver<(String, Json)>,
}

async fn start_room() -> Room {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (events_tx, events) = mpsc::unbounded_channel();
    let clients: Clients = Arc::default();
    let next_client = Arc::new(AtomicU64::new(0xC1));
    let next_msg = Arc::new(AtomicU64::new(0x1000));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_client(
                stream,
                Arc::clone(&clients),
                events_tx.clone(),
                Arc::clone(&next_client),
                Arc::clone(&next_msg),
            ));
        }
    });

    Room {
        url: format!("ws://{addr}"),
        events,
    }
}

async fn serve_client(
    stream: TcpStream,
    clients: Clients,
    events: mpsc::UnboundedSender<(String, Json)>,
    next_client: Arc<AtomicU64>,
    next_msg: Arc<AtomicU64>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let client_id = format!("{:016X}", next_client.fetch_add(1, Ordering::SeqCst));
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    clients.lock().await.insert(client_id.clone(), tx.clone());

    let identity = json!({
        "type": "identity",
        "data": {"id": client_id, "uuid": format!("uuid-{client_id}")},
    });
    let _ = tx.send(Message::Text(identity.to_string().into()));

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = source.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<Json>(text.as_str()) else {
            continue;
        };
        let msg_id = format!("{:016X}", next_msg.fetch_add(1, Ordering::SeqCst));
        match frame["type"].as_str() {
            Some("ping") => {
                let _ = tx.send(Message::Text(
                    json!({"type": "pong", "seq": frame["seq"]}).to_string().into(),
                ));
            }
            Some("broadcast") => {
                let envelope = json!({
                    "type": "broadcast",
                    "id": msg_id,
                    "from": client_id,
                    "timestamp": 0,
                    "data": frame["data"],
                });
                let _ = events.send((client_id.clone(), frame["data"].clone()));
                let text = envelope.to_string();
                for peer in clients.lock().await.values() {
                    let _ = peer.send(Message::Text(text.clone().into()));
                }
            }
            Some("unicast") => {
                let Some(target) = frame["to"].as_str() else {
                    continue;
                };
                let envelope = json!({
                    "type": "unicast",
                    "id": msg_id,
                    "from": client_id,
                    "to": target,
                    "timestamp": 0,
                    "data": frame["data"],
                });
                let _ = events.send((client_id.clone(), frame["data"].clone()));
                if let Some(peer) = clients.lock().await.get(target) {
                    let _ = peer.send(Message::Text(envelope.to_string().into()));
                }
            }
            _ => {}
        }
    }

    clients.lock().await.remove(&client_id);
}

fn entry(id: u64) -> LogEntry {
    let id = MsgId(id);
    LogEntry {
        id,
        parent: None,
        from: Some(MsgId(0x123)),
        nick: "n".into(),
        text: format!("t{}", id.0),
        timestamp: id.timestamp_ms(),
    }
}

fn scribe_with(url: &str, ids: &[u64], tweak: impl FnOnce(&mut ScribeConfig)) -> Scribe {
    let mut config = ScribeConfig::new(url);
    tweak(&mut config);
    let mut store = MemoryStore::new(None);
    store
        .extend(ids.iter().map(|&id| entry(id)).collect())
        .unwrap();
    Scribe::new(config, Box::new(store), Logger::disabled())
}

fn stored_ids(scribe: &Scribe) -> Vec<u64> {
    scribe
        .store()
        .query(None, None, None)
        .unwrap()
        .iter()
        .map(|e| e.id.0)
        .collect()
}

#[tokio::test]
async fn test_two_scribes_converge_and_finish_once() {
    let mut room = start_room().await;

    // An old-timer holding the deep archive, then a late joiner that
    // missed the oldest message.
    let deep = scribe_with(&room.url, &[0x10, 0x11, 0x12], |_| {});
    let deep_stop = deep.shutdown_handle();
    let deep_task = tokio::spawn(async move {
        let mut scribe = deep;
        let _ = scribe.run().await;
        scribe
    });
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let shallow = scribe_with(&room.url, &[0x11, 0x12], |_| {});
    let shallow_stop = shallow.shutdown_handle();
    let shallow_task = tokio::spawn(async move {
        let mut scribe = shallow;
        let _ = scribe.run().await;
        scribe
    });

    // Wait for both peers to broadcast log-done.
    let mut done_by: HashMap<String, usize> = HashMap::new();
    tokio::time::timeout(Duration::from_secs(20), async {
        while let Some((from, data)) = room.events.recv().await {
            if data["type"] == "log-done" {
                *done_by.entry(from).or_insert(0) += 1;
                if done_by.len() == 2 {
                    break;
                }
            }
        }
    })
    .await
    .expect("both scribes should finish gossiping");

    deep_stop.stop();
    shallow_stop.stop();
    let deep = tokio::time::timeout(Duration::from_secs(5), deep_task)
        .await
        .expect("deep scribe should shut down")
        .unwrap();
    let shallow = tokio::time::timeout(Duration::from_secs(5), shallow_task)
        .await
        .expect("shallow scribe should shut down")
        .unwrap();

    // Both stores hold the union of the histories.
    assert_eq!(stored_ids(&deep), vec![0x10, 0x11, 0x12]);
    assert_eq!(stored_ids(&shallow), vec![0x10, 0x11, 0x12]);

    // log-done went out exactly once per connection.
    while let Ok((from, data)) = room.events.try_recv() {
        if data["type"] == "log-done" {
            *done_by.entry(from).or_insert(0) += 1;
        }
    }
    assert!(
        done_by.values().all(|&count| count == 1),
        "log-done counts: {done_by:?}"
    );
}

#[tokio::test]
async fn test_empty_newcomer_pulls_full_dump_and_leaves() {
    let mut room = start_room().await;

    // A push-less seeder that only serves history.
    let seeder = scribe_with(&room.url, &[0x10, 0x11, 0x12], |c| c.dont_pull = true);
    let seeder_stop = seeder.shutdown_handle();
    let seeder_task = tokio::spawn(async move {
        let mut scribe = seeder;
        let _ = scribe.run().await;
        scribe
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The newcomer backfills everything and leaves once done.
    let newcomer = scribe_with(&room.url, &[], |c| c.dont_stay = true);
    let newcomer_task = tokio::spawn(async move {
        let mut scribe = newcomer;
        scribe.run().await.expect("newcomer run should succeed");
        scribe
    });

    let newcomer = tokio::time::timeout(Duration::from_secs(15), newcomer_task)
        .await
        .expect("newcomer should finish and disconnect on its own")
        .unwrap();
    assert_eq!(stored_ids(&newcomer), vec![0x10, 0x11, 0x12]);

    // The newcomer announced completion before leaving.
    let mut saw_done = false;
    while let Ok((_, data)) = room.events.try_recv() {
        if data["type"] == "log-done" {
            saw_done = true;
        }
    }
    assert!(saw_done);

    seeder_stop.stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), seeder_task)
        .await
        .expect("seeder should shut down");
}
