//! End-to-end tests for docsync-server.
//!
//! Drives a real relay (`Relay` + `WebSocketServer`) over a `127.0.0.1:0`
//! listener with plain `tokio-tungstenite` clients speaking the JSON
//! text-frame protocol directly, exercising the scenarios from
//! SPEC_FULL.md §8 rather than going through `docsync-core`'s own client.
//!
//! Grounded on `sync-daemon/tests/e2e.rs`'s style: a `TestClient` wrapper
//! around the raw WebSocket, a background accept loop, `tokio::time::timeout`
//! around every receive. Operations/snapshots are plain `String`s here (the
//! relay is generic over them) so a test frame is just a literal string, not
//! a Loro CRDT payload.

use std::sync::Arc;
use std::time::Duration;

use docsync_core::{AuthPayload, ClientMessage, DocumentId, InMemoryServerProvider, ServerMessage};
use docsync_server::{run_event_loop, Relay, WebSocketServer};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Provider = InMemoryServerProvider<String, String>;
type Msg = ServerMessage<String, String>;

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_request_id: u64,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let url = format!("ws://{addr}");
        let (ws, _) = connect_async(&url).await.expect("failed to connect");
        Self { ws, next_request_id: 0 }
    }

    fn request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    async fn send(&mut self, msg: &ClientMessage<String>) {
        let text = serde_json::to_string(msg).unwrap();
        self.ws.send(Message::Text(text.into())).await.expect("send failed");
    }

    async fn recv(&mut self) -> Msg {
        loop {
            match timeout(Duration::from_secs(2), self.ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    return serde_json::from_str(&text).expect("invalid server message");
                }
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
                Ok(Some(Ok(Message::Close(_)))) => panic!("connection closed unexpectedly"),
                Ok(Some(Ok(other))) => panic!("unexpected frame: {other:?}"),
                Ok(Some(Err(e))) => panic!("websocket error: {e}"),
                Ok(None) => panic!("stream ended unexpectedly"),
                Err(_) => panic!("timed out waiting for a server message"),
            }
        }
    }

    async fn authenticate(&mut self, token: &str) {
        let request_id = self.request_id();
        self.send(&ClientMessage::Authenticate {
            request_id,
            auth: AuthPayload { token: token.to_string(), device_id: "test-device".into() },
        })
        .await;
        match self.recv().await {
            Msg::AuthResult { ok, .. } => assert!(ok, "authentication rejected"),
            other => panic!("expected AuthResult, got {other:?}"),
        }
    }

    async fn push(&mut self, doc_id: DocumentId, ops: Vec<String>, clock: u64) -> (u64, Vec<String>) {
        let request_id = self.request_id();
        self.send(&ClientMessage::SyncOperations { request_id, doc_id, operations: Some(ops), clock }).await;
        match self.recv().await {
            Msg::SyncOperationsResult { clock, operations, .. } => (clock, operations),
            other => panic!("expected SyncOperationsResult, got {other:?}"),
        }
    }

    async fn pull(&mut self, doc_id: DocumentId, clock: u64) -> (u64, Vec<String>) {
        let request_id = self.request_id();
        self.send(&ClientMessage::SyncOperations { request_id, doc_id, operations: None, clock }).await;
        match self.recv().await {
            Msg::SyncOperationsResult { clock, operations, .. } => (clock, operations),
            other => panic!("expected SyncOperationsResult, got {other:?}"),
        }
    }
}

async fn spawn_relay(squash_threshold: usize) -> std::net::SocketAddr {
    let squash: docsync_core::SquashFn<String, String> = Arc::new(|base, ops| {
        format!("{}+{}", base.cloned().unwrap_or_default(), ops.join(","))
    });
    let provider = Arc::new(Provider::new(squash).with_squash_threshold(squash_threshold));
    let authenticate: docsync_server::Authenticate = Arc::new(|auth| {
        Box::pin(async move {
            (!auth.token.is_empty())
                .then(|| docsync_server::AuthContext { user_id: auth.token, context: serde_json::Value::Null })
        })
    });
    let relay = Arc::new(Relay::new(provider, authenticate, None));
    let (mut server, event_rx) = WebSocketServer::new(relay.clone());
    let listener = WebSocketServer::<Provider>::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(run_event_loop(relay, event_rx));
    tokio::spawn(async move {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            server.accept_connection(stream, peer_addr).await;
        }
    });

    addr
}

#[tokio::test]
async fn unauthenticated_sync_operations_is_rejected() {
    let addr = spawn_relay(100).await;
    let mut client = TestClient::connect(addr).await;
    let doc_id = DocumentId::generate();

    let request_id = client.request_id();
    client
        .send(&ClientMessage::SyncOperations { request_id, doc_id, operations: Some(vec!["a".into()]), clock: 0 })
        .await;
    match client.recv().await {
        Msg::Error { error, .. } => assert_eq!(error, "unauthorized"),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_token_closes_the_connection() {
    let addr = spawn_relay(100).await;
    let mut client = TestClient::connect(addr).await;

    let request_id = client.request_id();
    client
        .send(&ClientMessage::Authenticate { request_id, auth: AuthPayload { token: String::new(), device_id: "d".into() } })
        .await;
    match client.recv().await {
        Msg::AuthResult { ok, .. } => assert!(!ok),
        other => panic!("expected AuthResult, got {other:?}"),
    }
}

/// Scenario 1 (§8): client A creates a doc and pushes; client B, already
/// subscribed via an earlier pull, catches up to A's operations.
#[tokio::test]
async fn sibling_pulls_operations_pushed_by_another_client() {
    let addr = spawn_relay(100).await;
    let doc_id = DocumentId::generate();

    let mut a = TestClient::connect(addr).await;
    a.authenticate("user-a").await;
    let mut b = TestClient::connect(addr).await;
    b.authenticate("user-b").await;

    // B subscribes first (a pull with no ops, establishing room membership).
    let (b_clock, _) = b.pull(doc_id, 0).await;
    assert_eq!(b_clock, 0);

    let (a_clock, a_pending) = a.push(doc_id, vec!["op1".into(), "op2".into()], 0).await;
    assert_eq!(a_clock, 2);
    assert!(a_pending.is_empty(), "pusher shouldn't get its own ops echoed back");

    // B should receive an unsolicited Dirty push now that A's pushed ops exist.
    match b.recv().await {
        Msg::Dirty { doc_id: dirty_doc } => assert_eq!(dirty_doc, doc_id),
        other => panic!("expected Dirty, got {other:?}"),
    }

    let (b_clock, b_ops) = b.pull(doc_id, b_clock).await;
    assert_eq!(b_clock, 2);
    assert_eq!(b_ops, vec!["op1".to_string(), "op2".to_string()]);
}

/// Scenario: a client behind the server's squash threshold gets a snapshot
/// rather than the (now-compacted) raw operation range.
#[tokio::test]
async fn client_behind_squash_threshold_receives_a_snapshot() {
    let addr = spawn_relay(2).await;
    let doc_id = DocumentId::generate();

    let mut a = TestClient::connect(addr).await;
    a.authenticate("user-a").await;
    a.push(doc_id, vec!["op1".into(), "op2".into()], 0).await;

    let mut b = TestClient::connect(addr).await;
    b.authenticate("user-b").await;
    let request_id = b.request_id();
    b.send(&ClientMessage::SyncOperations { request_id, doc_id, operations: None, clock: 0 }).await;
    match b.recv().await {
        Msg::SyncOperationsResult { serialized_doc, operations, .. } => {
            assert!(serialized_doc.is_some(), "client behind the squash cutoff must get a snapshot");
            assert!(operations.is_empty());
        }
        other => panic!("expected SyncOperationsResult, got {other:?}"),
    }
}

/// Scenario 5 (§8): presence updates fan out to other subscribers, and a
/// disconnect clears presence for everyone still in the room.
#[tokio::test]
async fn presence_broadcasts_to_others_and_clears_on_disconnect() {
    let addr = spawn_relay(100).await;
    let doc_id = DocumentId::generate();

    let mut a = TestClient::connect(addr).await;
    a.authenticate("user-a").await;
    a.pull(doc_id, 0).await;

    let mut b = TestClient::connect(addr).await;
    b.authenticate("user-b").await;
    b.pull(doc_id, 0).await;

    let request_id = a.request_id();
    a.send(&ClientMessage::Presence { request_id, doc_id, presence: serde_json::json!({"cursor": 5}) }).await;
    match a.recv().await {
        Msg::Ok { .. } => {}
        other => panic!("expected Ok, got {other:?}"),
    }

    match b.recv().await {
        Msg::Presence { presence, .. } => {
            assert_eq!(presence.len(), 1);
            let (_, value) = presence.into_iter().next().unwrap();
            assert_eq!(value, Some(serde_json::json!({"cursor": 5})));
        }
        other => panic!("expected Presence, got {other:?}"),
    }

    drop(a);

    match b.recv().await {
        Msg::Presence { presence, .. } => {
            let (_, value) = presence.into_iter().next().unwrap();
            assert_eq!(value, None, "disconnect must clear presence, not just drop the socket");
        }
        other => panic!("expected Presence, got {other:?}"),
    }
}

#[tokio::test]
async fn delete_doc_round_trips_through_the_relay() {
    let addr = spawn_relay(100).await;
    let doc_id = DocumentId::generate();

    let mut a = TestClient::connect(addr).await;
    a.authenticate("user-a").await;
    a.push(doc_id, vec!["op1".into()], 0).await;

    let request_id = a.request_id();
    a.send(&ClientMessage::DeleteDoc { request_id, doc_id }).await;
    match a.recv().await {
        Msg::DeleteDocResult { success, .. } => assert!(success),
        other => panic!("expected DeleteDocResult, got {other:?}"),
    }

    let request_id = a.request_id();
    a.send(&ClientMessage::DeleteDoc { request_id, doc_id }).await;
    match a.recv().await {
        Msg::DeleteDocResult { success, .. } => assert!(!success, "already deleted"),
        other => panic!("expected DeleteDocResult, got {other:?}"),
    }
}

#[tokio::test]
async fn get_doc_returns_none_until_a_snapshot_exists() {
    let addr = spawn_relay(2).await;
    let doc_id = DocumentId::generate();

    let mut a = TestClient::connect(addr).await;
    a.authenticate("user-a").await;

    let request_id = a.request_id();
    a.send(&ClientMessage::GetDoc { request_id, doc_id }).await;
    match a.recv().await {
        Msg::GetDocResult { doc, .. } => assert!(doc.is_none(), "no snapshot has been materialized yet"),
        other => panic!("expected GetDocResult, got {other:?}"),
    }

    a.push(doc_id, vec!["op1".into(), "op2".into()], 0).await;

    let request_id = a.request_id();
    a.send(&ClientMessage::GetDoc { request_id, doc_id }).await;
    match a.recv().await {
        Msg::GetDocResult { doc, .. } => assert!(doc.is_some(), "squash threshold of 2 should have produced a snapshot"),
        other => panic!("expected GetDocResult, got {other:?}"),
    }
}
