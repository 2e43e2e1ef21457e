//! Transport: the bidirectional channel to the relay (spec §6, §6.1).
//!
//! Grounded on `sync-core/src/transport.rs::SyncTransport`/`PeerConnection`
//! for the `cfg_attr` wasm32-vs-native `async_trait` split; the method
//! surface itself is new, since the teacher's transport dials many peers
//! directly while this one speaks to exactly one relay and must correlate
//! request/response pairs against unsolicited server pushes.

use async_trait::async_trait;

use crate::binding::ListenerId;
use crate::error::TransportError;
use crate::protocol::{ClientMessage, ServerMessage};

/// A connected (or reconnecting) channel to the relay for one doc-schema
/// pairing `(O, S)`.
///
/// `request` resolves when a `ServerMessage` whose `request_id` matches
/// arrives, or errors on connection loss (spec §6.1). Implementations own
/// their own reconnect policy; see `transport_ws::WsTransport` for the
/// native, exponential-backoff-with-jitter implementation (spec §9).
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Transport<O: Send + Sync + 'static, S: Send + Sync + 'static>: Send + Sync {
    /// Send a request-shaped `ClientMessage` and await its correlated ack.
    async fn request(&self, msg: ClientMessage<O>) -> Result<ServerMessage<O, S>, TransportError>;

    /// Register a handler for unsolicited server pushes (`Dirty`,
    /// `Presence`). Never invoked for ack responses to `request`.
    fn on_push(&self, handler: Box<dyn Fn(ServerMessage<O, S>) + Send + Sync>) -> ListenerId;

    /// Register a handler fired each time the transport (re)establishes a
    /// connection, including the first one. `ServerSync` uses this to
    /// replay subscriptions and probe every subscribed doc (spec §4.3.5).
    fn on_connect(&self, handler: Box<dyn Fn() + Send + Sync>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::ids::DocumentId;

    /// Minimal in-process transport for exercising callers of `Transport`
    /// without a real socket: `request` always replies with a canned
    /// `Ok`, matching the message's own `request_id`.
    struct LoopbackTransport {
        push_listeners: Mutex<Vec<Box<dyn Fn(ServerMessage<String, String>) + Send + Sync>>>,
        connect_listeners: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
        next_id: AtomicU64,
    }

    impl LoopbackTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                push_listeners: Mutex::new(Vec::new()),
                connect_listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            })
        }

        fn fire_connect(&self) {
            for handler in self.connect_listeners.lock().unwrap().iter() {
                handler();
            }
        }

        fn fire_push(&self, msg: ServerMessage<String, String>) {
            for handler in self.push_listeners.lock().unwrap().iter() {
                handler(msg.clone());
            }
        }
    }

    #[async_trait]
    impl Transport<String, String> for LoopbackTransport {
        async fn request(
            &self,
            msg: ClientMessage<String>,
        ) -> Result<ServerMessage<String, String>, TransportError> {
            Ok(ServerMessage::Ok { request_id: msg.request_id() })
        }

        fn on_push(&self, handler: Box<dyn Fn(ServerMessage<String, String>) + Send + Sync>) -> ListenerId {
            self.push_listeners.lock().unwrap().push(handler);
            self.next_id.fetch_add(1, Ordering::SeqCst)
        }

        fn on_connect(&self, handler: Box<dyn Fn() + Send + Sync>) -> ListenerId {
            self.connect_listeners.lock().unwrap().push(handler);
            self.next_id.fetch_add(1, Ordering::SeqCst)
        }

        fn remove_listener(&self, _id: ListenerId) {}
    }

    #[tokio::test]
    async fn request_echoes_request_id() {
        let transport = LoopbackTransport::new();
        let reply = transport
            .request(ClientMessage::Subscribe { request_id: 42, doc_id: DocumentId::generate() })
            .await
            .unwrap();
        assert_eq!(reply.request_id(), Some(42));
    }

    #[tokio::test]
    async fn connect_and_push_listeners_fire() {
        let transport = LoopbackTransport::new();
        let connected = Arc::new(AtomicU64::new(0));
        let connected_clone = connected.clone();
        transport.on_connect(Box::new(move || {
            connected_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let doc_id = DocumentId::generate();
        let dirty_count = Arc::new(AtomicU64::new(0));
        let dirty_clone = dirty_count.clone();
        transport.on_push(Box::new(move |msg| {
            if matches!(msg, ServerMessage::Dirty { .. }) {
                dirty_clone.fetch_add(1, Ordering::SeqCst);
            }
        }));

        transport.fire_connect();
        transport.fire_push(ServerMessage::Dirty { doc_id });

        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(dirty_count.load(Ordering::SeqCst), 1);
    }
}
