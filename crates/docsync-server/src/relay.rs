//! `Relay`: the coordinator interpreting [`ConnectionEvent`]s against the
//! protocol in spec §4.4.1–§4.4.3 and dispatching into a `ServerProvider`.
//!
//! Restructured from `sync-daemon/src/manager.rs`'s `ConnectionManager` (the
//! coordinator owning connection state and emitting `ManagerEvent`s for a
//! main loop to act on) around §4.4's RPCs instead of the lineage's
//! peer-mesh handshake/gossip events: this relay has no notion of "this
//! peer is already connected via another route" since every socket is a
//! distinct client, never a peer that might dial back. `authenticate`/
//! `authorize` are injected as `Arc<dyn Fn(...) -> ... + Send + Sync>`
//! closures so this crate never bakes in a concrete auth scheme.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use docsync_core::{AuthPayload, ClientMessage, DocumentId, ServerMessage, ServerProvider, SyncRequest};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::connection::{Connection, ConnectionEvent, SocketId};
use crate::room::Rooms;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What `authenticate` resolves a valid token to (spec §4.4.1 step 3).
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub context: serde_json::Value,
}

pub type Authenticate = Arc<dyn Fn(AuthPayload) -> BoxFuture<'static, Option<AuthContext>> + Send + Sync>;
/// Per-`sync-operations` authorization check (spec §4.4.2 step 1). `None`
/// means every authenticated socket may sync every doc.
pub type Authorize = Arc<dyn Fn(AuthContext, DocumentId) -> BoxFuture<'static, bool> + Send + Sync>;

struct SocketState {
    auth: Option<AuthContext>,
    device_id: Option<String>,
}

/// Owns `rooms`/`presence`/`sockets` (spec §4.4's per-server state) and the
/// live connection handles, and interprets every [`ConnectionEvent`].
pub struct Relay<P: ServerProvider> {
    provider: Arc<P>,
    rooms: Rooms,
    connections: Mutex<HashMap<SocketId, Arc<Connection<P::Operations, P::Snapshot>>>>,
    sockets: RwLock<HashMap<SocketId, SocketState>>,
    authenticate: Authenticate,
    authorize: Option<Authorize>,
}

impl<P> Relay<P>
where
    P: ServerProvider + 'static,
    P::Operations: Clone + Serialize + Send + Sync + 'static,
    P::Snapshot: Clone + Serialize + Send + Sync + 'static,
{
    pub fn new(provider: Arc<P>, authenticate: Authenticate, authorize: Option<Authorize>) -> Self {
        Self {
            provider,
            rooms: Rooms::new(),
            connections: Mutex::new(HashMap::new()),
            sockets: RwLock::new(HashMap::new()),
            authenticate,
            authorize,
        }
    }

    pub async fn register(&self, connection: Arc<Connection<P::Operations, P::Snapshot>>) {
        let socket_id = connection.socket_id;
        self.connections.lock().await.insert(socket_id, connection);
        self.sockets.write().await.insert(socket_id, SocketState { auth: None, device_id: None });
    }

    pub async fn handle_event(&self, event: ConnectionEvent<P::Operations>) {
        match event {
            ConnectionEvent::Message { socket_id, message } => self.handle_message(socket_id, message).await,
            ConnectionEvent::Closed { socket_id } => self.handle_disconnect(socket_id).await,
        }
    }

    async fn handle_message(&self, socket_id: SocketId, message: ClientMessage<P::Operations>) {
        match message {
            ClientMessage::Authenticate { request_id, auth } => self.handle_authenticate(socket_id, request_id, auth).await,
            ClientMessage::SyncOperations { request_id, doc_id, operations, clock } => {
                self.handle_sync_operations(socket_id, request_id, doc_id, operations, clock).await
            }
            ClientMessage::Subscribe { request_id, doc_id } => {
                if self.require_auth(socket_id).await.is_none() {
                    self.send_error(socket_id, request_id, "unauthorized").await;
                    return;
                }
                self.rooms.subscribe(doc_id, socket_id);
                self.send(socket_id, &ServerMessage::Ok { request_id }).await;
            }
            ClientMessage::Unsubscribe { request_id, doc_id } => {
                self.rooms.unsubscribe(doc_id, socket_id);
                self.send(socket_id, &ServerMessage::Ok { request_id }).await;
            }
            ClientMessage::Presence { request_id, doc_id, presence } => {
                self.handle_presence(socket_id, request_id, doc_id, presence).await
            }
            ClientMessage::DeleteDoc { request_id, doc_id } => {
                if self.require_auth(socket_id).await.is_none() {
                    self.send_error(socket_id, request_id, "unauthorized").await;
                    return;
                }
                let success = self.provider.delete(doc_id).await.unwrap_or(false);
                self.send(socket_id, &ServerMessage::DeleteDocResult { request_id, success }).await;
            }
            ClientMessage::GetDoc { request_id, doc_id } => self.handle_get_doc(socket_id, request_id, doc_id).await,
        }
    }

    async fn handle_authenticate(&self, socket_id: SocketId, request_id: u64, auth: AuthPayload) {
        if auth.token.is_empty() {
            warn!(%socket_id, "rejecting connection: no token provided");
            self.send(socket_id, &ServerMessage::AuthResult { request_id, ok: false }).await;
            self.close(socket_id).await;
            return;
        }

        match (self.authenticate)(auth.clone()).await {
            Some(ctx) => {
                info!(%socket_id, user_id = %ctx.user_id, device_id = %auth.device_id, "client connected");
                let mut sockets = self.sockets.write().await;
                if let Some(state) = sockets.get_mut(&socket_id) {
                    state.auth = Some(ctx);
                    state.device_id = Some(auth.device_id);
                }
                drop(sockets);
                self.send(socket_id, &ServerMessage::AuthResult { request_id, ok: true }).await;
            }
            None => {
                warn!(%socket_id, "rejecting connection: invalid token");
                self.send(socket_id, &ServerMessage::AuthResult { request_id, ok: false }).await;
                self.close(socket_id).await;
            }
        }
    }

    async fn handle_sync_operations(
        &self,
        socket_id: SocketId,
        request_id: u64,
        doc_id: DocumentId,
        operations: Option<Vec<P::Operations>>,
        clock: u64,
    ) {
        let Some(ctx) = self.require_auth(socket_id).await else {
            self.send_error(socket_id, request_id, "unauthorized").await;
            return;
        };

        if let Some(authorize) = &self.authorize {
            if !authorize(ctx, doc_id).await {
                self.send_error(socket_id, request_id, "unauthorized").await;
                return;
            }
        }

        // First sync-operations for a doc implicitly subscribes (§4.4.2 step 2).
        self.rooms.subscribe(doc_id, socket_id);

        let pushed_non_empty = operations.as_ref().is_some_and(|ops| !ops.is_empty());
        match self.provider.sync(SyncRequest { doc_id, operations, clock }).await {
            Ok(resp) => {
                self.send(
                    socket_id,
                    &ServerMessage::SyncOperationsResult {
                        request_id,
                        doc_id,
                        clock: resp.clock,
                        operations: resp.operations,
                        serialized_doc: resp.serialized_doc,
                    },
                )
                .await;

                if pushed_non_empty {
                    let others = self.rooms.other_subscribers(doc_id, socket_id);
                    self.broadcast(&others, &ServerMessage::Dirty { doc_id }).await;
                }
            }
            Err(e) => self.send_error(socket_id, request_id, &e.to_string()).await,
        }
    }

    async fn handle_presence(&self, socket_id: SocketId, request_id: u64, doc_id: DocumentId, presence: serde_json::Value) {
        if self.require_auth(socket_id).await.is_none() {
            self.send_error(socket_id, request_id, "unauthorized").await;
            return;
        }
        if !self.rooms.is_subscribed(doc_id, socket_id) {
            self.send_error(socket_id, request_id, "not subscribed").await;
            return;
        }

        self.rooms.set_presence(doc_id, socket_id, presence.clone());
        let others = self.rooms.other_subscribers(doc_id, socket_id);
        let mut patch = HashMap::new();
        patch.insert(socket_id.to_string(), Some(presence));
        self.broadcast(&others, &ServerMessage::Presence { doc_id, presence: patch }).await;
        self.send(socket_id, &ServerMessage::Ok { request_id }).await;
    }

    /// `GetDoc` has no direct `ServerProvider` counterpart: the trait only
    /// exposes the combined push+pull `sync` operation. Pull the current
    /// state with an empty push from clock 0 and hand back the snapshot if
    /// one exists (the doc has been squashed at least once); a doc that
    /// exists only as an unsquashed op log has no single serialized form to
    /// return here, so callers needing the full history should subscribe
    /// and issue `sync-operations` instead.
    async fn handle_get_doc(&self, socket_id: SocketId, request_id: u64, doc_id: DocumentId) {
        if self.require_auth(socket_id).await.is_none() {
            self.send_error(socket_id, request_id, "unauthorized").await;
            return;
        }

        let doc = match self.provider.sync(SyncRequest { doc_id, operations: None, clock: 0 }).await {
            Ok(resp) => resp
                .serialized_doc
                .map(|serialized_doc| docsync_core::GetDocPayload { serialized_doc, clock: resp.clock }),
            Err(e) => {
                self.send_error(socket_id, request_id, &e.to_string()).await;
                return;
            }
        };
        self.send(socket_id, &ServerMessage::GetDocResult { request_id, doc }).await;
    }

    async fn handle_disconnect(&self, socket_id: SocketId) {
        self.connections.lock().await.remove(&socket_id);
        self.sockets.write().await.remove(&socket_id);

        for (doc_id, others) in self.rooms.leave_all(socket_id) {
            let mut patch = HashMap::new();
            patch.insert(socket_id.to_string(), None);
            self.broadcast(&others, &ServerMessage::Presence { doc_id, presence: patch }).await;
        }
    }

    async fn require_auth(&self, socket_id: SocketId) -> Option<AuthContext> {
        self.sockets.read().await.get(&socket_id).and_then(|s| s.auth.clone())
    }

    async fn send(&self, socket_id: SocketId, msg: &ServerMessage<P::Operations, P::Snapshot>) {
        let conn = self.connections.lock().await.get(&socket_id).cloned();
        if let Some(conn) = conn {
            if let Err(e) = conn.send(msg).await {
                warn!(%socket_id, error = %e, "failed to send message");
            }
        }
    }

    async fn send_error(&self, socket_id: SocketId, request_id: u64, error: &str) {
        self.send(socket_id, &ServerMessage::Error { request_id, error: error.to_string() }).await;
    }

    async fn broadcast(&self, targets: &[SocketId], msg: &ServerMessage<P::Operations, P::Snapshot>) {
        for socket_id in targets {
            self.send(*socket_id, msg).await;
        }
    }

    async fn close(&self, socket_id: SocketId) {
        let conn = self.connections.lock().await.remove(&socket_id);
        if let Some(conn) = conn {
            // `Connection` has no &self close (it needs &mut self); dropping
            // the last Arc aborts its read task via `Drop`, which is enough
            // to tear the socket down after a rejected handshake.
            drop(conn);
        }
        self.sockets.write().await.remove(&socket_id);
    }
}
