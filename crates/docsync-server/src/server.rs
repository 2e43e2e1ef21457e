//! WebSocket server: accept loop and connection-event plumbing.
//!
//! Kept near-identical in structure to `sync-daemon/src/server.rs`'s
//! `WebSocketServer` (temp-id-style socket allocation, the same
//! handshake-vs-health-check error-logging split in `accept_connection`),
//! generalized from a peer-id-keyed connection map to [`SocketId`]s and
//! handing every event to a [`Relay`] rather than routing by resolved peer
//! identity — this directly grounds spec §8 P9's dirty fan-out, since the
//! relay is the single place `broadcast`/`broadcast_except` style fan-out
//! happens.

use std::net::SocketAddr;
use std::sync::Arc;

use docsync_core::ServerProvider;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info};

use crate::connection::{Connection, ConnectionEvent, SocketIdGenerator};
use crate::relay::Relay;

pub struct WebSocketServer<P: ServerProvider> {
    relay: Arc<Relay<P>>,
    socket_ids: SocketIdGenerator,
    event_tx: mpsc::UnboundedSender<ConnectionEvent<P::Operations>>,
}

impl<P> WebSocketServer<P>
where
    P: ServerProvider + 'static,
    P::Operations: Clone + Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    P::Snapshot: Clone + Serialize + Send + Sync + 'static,
{
    /// `accept_connection` and the returned event loop share one connection
    /// map (inside `relay`) but otherwise don't borrow from each other, so
    /// a caller's `tokio::select!` can drive accepting and event dispatch
    /// as two independent futures — `run_event_loop` owns the receiver and
    /// is typically `tokio::spawn`ed once rather than polled inline.
    pub fn new(relay: Arc<Relay<P>>) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent<P::Operations>>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self { relay, socket_ids: SocketIdGenerator::default(), event_tx }, event_rx)
    }

    pub async fn bind(listen_addr: &str) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!(%listen_addr, "relay listening");
        Ok(listener)
    }

    /// Upgrade one accepted TCP stream to a WebSocket connection and hand it
    /// to the relay. Health checks (e.g. `nc -z`) connect and close before
    /// completing the WebSocket handshake; those are logged at `debug`, not
    /// `error`, matching the lineage's distinction.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!(%addr, "connection closed before handshake");
                } else {
                    error!(%addr, error = %e, "websocket upgrade failed");
                }
                return;
            }
        };

        let socket_id = self.socket_ids.next();
        info!(%addr, %socket_id, "new connection");

        let connection = Arc::new(Connection::new(socket_id, ws_stream, self.event_tx.clone()));
        self.relay.register(connection).await;
    }
}

/// Drain connection events, handing each to `relay` in order. Returns when
/// every `Connection`'s event sender has dropped (the process is shutting
/// down). Free function rather than a `WebSocketServer` method so it can be
/// `tokio::spawn`ed independently of the accept loop without borrowing
/// `&mut self` from both places at once.
pub async fn run_event_loop<P>(relay: Arc<Relay<P>>, mut event_rx: mpsc::UnboundedReceiver<ConnectionEvent<P::Operations>>)
where
    P: ServerProvider + 'static,
    P::Operations: Clone + Serialize + Send + Sync + 'static,
    P::Snapshot: Clone + Serialize + Send + Sync + 'static,
{
    while let Some(event) = event_rx.recv().await {
        relay.handle_event(event).await;
    }
}
