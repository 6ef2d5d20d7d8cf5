//! WebSocket connection plumbing.
//!
//! Each connection is split into a writer task draining an unbounded
//! channel into the sink (which serializes all sends without a lock) and
//! a reader task feeding decoded text frames into the engine scheduler
//! via `add_now`, preserving arrival order. The reader always submits
//! [`Task::ConnectionClosed`] on its way out, so connection teardown is
//! observed exactly once by the dispatcher regardless of who closed.

use std::fmt;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::scheduler::EventScheduler;
use crate::scribe::Task;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
pub type WsSource = SplitStream<WsStream>;

/// Transport-level failure.
#[derive(Debug)]
pub enum ClientError {
    /// DNS, TCP, TLS, or WebSocket handshake failure.
    Connect(tokio_tungstenite::tungstenite::Error),
    /// A send was attempted without an open connection.
    NotConnected,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "connection failed: {e}"),
            ClientError::NotConnected => write!(f, "not connected"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Connect(e) => Some(e),
            ClientError::NotConnected => None,
        }
    }
}

/// Establish a WebSocket connection to the room URL.
pub async fn connect(url: &str) -> Result<WsStream, ClientError> {
    let (ws, _response) = connect_async(url).await.map_err(ClientError::Connect)?;
    Ok(ws)
}

/// Spawn the writer task. Dropping the sender closes the connection.
pub fn spawn_writer(
    mut sink: WsSink,
    mut rx: mpsc::UnboundedReceiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                debug!("websocket send failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    })
}

/// Spawn the reader task.
///
/// Text frames become [`Task::Frame`] submissions in arrival order.
/// Binary frames are ignored. A read timeout (when configured) submits
/// [`Task::ReadTimeout`] and tears the connection down, since the stream
/// is not safely resumable afterwards.
pub fn spawn_reader(
    mut source: WsSource,
    sched: EventScheduler<Task>,
    read_timeout: Option<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame = match read_timeout {
                Some(limit) => match tokio::time::timeout(limit, source.next()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        sched.add_now(Task::ReadTimeout(limit));
                        break;
                    }
                },
                None => source.next().await,
            };
            match frame {
                None => break,
                Some(Err(e)) => {
                    debug!("websocket read failed: {e}");
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    sched.add_now(Task::Frame(text.to_string()));
                }
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
        sched.add_now(Task::ConnectionClosed);
    })
}
