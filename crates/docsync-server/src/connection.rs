//! Individual socket connection management.
//!
//! Each connection wraps a WebSocket stream, handling the split between
//! read and write halves for async operation.
//!
//! Grounded on `sync-daemon/src/connection.rs`'s `PeerConnection` (split
//! sink/stream, a spawned read task forwarding frames through an
//! `mpsc::unbounded_channel` of events, `Drop` aborting the read task), with
//! the binary handshake/message split replaced by `docsync_core::protocol`'s
//! single JSON-text-frame wire format (spec §6.1): every inbound frame is
//! exactly one `ClientMessage<O>`, there is no separate handshake framing —
//! `Authenticate` is just another message variant.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use docsync_core::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// Largest JSON text frame the relay accepts from a client before closing
/// the connection; guards against a misbehaving client exhausting memory.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Identifies a connection for the lifetime of the process. Never sent over
/// the wire — purely an internal key for the relay's room/presence maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket-{}", self.0)
    }
}

#[derive(Default)]
pub struct SocketIdGenerator(AtomicU64);

impl SocketIdGenerator {
    pub fn next(&self) -> SocketId {
        SocketId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Internal event emitted by a connection's read loop.
#[derive(Debug)]
pub enum ConnectionEvent<O> {
    Message { socket_id: SocketId, message: ClientMessage<O> },
    Closed { socket_id: SocketId },
}

type WsSink = futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = futures::stream::SplitStream<WebSocketStream<TcpStream>>;

/// A single accepted WebSocket connection.
pub struct Connection<O, S> {
    pub socket_id: SocketId,
    write: Arc<Mutex<WsSink>>,
    read_task: Option<JoinHandle<()>>,
    _marker: std::marker::PhantomData<fn() -> (O, S)>,
}

impl<O, S> Connection<O, S>
where
    O: DeserializeOwned + Send + 'static,
{
    /// Wrap an accepted stream, spawning its read loop.
    pub fn new(
        socket_id: SocketId,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent<O>>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let read_task = tokio::spawn(Self::read_loop(socket_id, read, event_tx));

        Self { socket_id, write, read_task: Some(read_task), _marker: std::marker::PhantomData }
    }

    async fn read_loop(
        socket_id: SocketId,
        mut read: WsSource,
        event_tx: mpsc::UnboundedSender<ConnectionEvent<O>>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > MAX_MESSAGE_SIZE {
                        warn!(%socket_id, size = text.len(), "message exceeds max size, closing connection");
                        break;
                    }
                    match serde_json::from_str::<ClientMessage<O>>(&text) {
                        Ok(message) => {
                            let _ = event_tx.send(ConnectionEvent::Message { socket_id, message });
                        }
                        Err(e) => {
                            warn!(%socket_id, error = %e, "failed to decode client message, ignoring frame");
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(%socket_id, "client sent a binary frame; protocol only allows JSON text, closing");
                    break;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) => {
                    debug!(%socket_id, "received close frame");
                    break;
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => debug!(%socket_id, "connection closed"),
                        _ => error!(%socket_id, error = %e, "websocket read error"),
                    }
                    break;
                }
                None => {
                    debug!(%socket_id, "stream ended");
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { socket_id });
    }

    /// Send one server message as a JSON text frame.
    pub async fn send(&self, msg: &ServerMessage<O, S>) -> Result<(), ConnectionSendError>
    where
        O: Serialize,
        S: Serialize,
    {
        let text = serde_json::to_string(msg).map_err(|e| ConnectionSendError::Encode(e.to_string()))?;
        self.write
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ConnectionSendError::Io(e.to_string()))
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionSendError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to write frame: {0}")]
    Io(String),
}

impl<O, S> Drop for Connection<O, S> {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
