//! ServerSync: the per-doc push/pull state machine (spec §4.3).
//!
//! Grounded on `sync-core/src/sync_engine.rs` for its error-enum shape and
//! `#[tokio::test]` regression-test style; the state machine itself is new
//! since the lineage's symmetric version-vector exchange has no concept of
//! an asymmetric server clock to push against.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::warn;

use crate::binding::DocBinding;
use crate::docstore::{DocStore, ServerSyncHandle};
use crate::error::TransportError;
use crate::ids::DocumentId;
use crate::protocol::{ClientMessage, RequestIdGenerator, ServerMessage};
use crate::provider::{ClientProvider, ClientTransaction, TransactionMode};
use crate::transport::Transport;

const BASE_BACKOFF: std::time::Duration = std::time::Duration::from_millis(200);
const MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(5);
const WARN_AFTER_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushState {
    Idle,
    Pushing,
    PushingWithPending,
}

/// The per-doc push/pull state machine. Holds a strong reference to the
/// `DocStore` it applies remote batches into; `DocStore` in turn holds this
/// only as a type-erased [`ServerSyncHandle`] set after both are
/// constructed, so there is no reference cycle. `self_weak` lets the
/// synchronous [`ServerSyncHandle`] methods (which only receive `&self`)
/// spawn the async work that needs an owned `Arc<Self>`.
pub struct ServerSync<B, P, T>
where
    B: DocBinding,
    P: ClientProvider<Operations = B::Operations, Snapshot = B::Snapshot>,
    T: Transport<B::Operations, B::Snapshot>,
{
    binding: Arc<B>,
    provider: Arc<P>,
    transport: Arc<T>,
    doc_store: Arc<DocStore<B, P>>,
    states: Mutex<HashMap<DocumentId, PushState>>,
    subscriptions: Mutex<HashSet<DocumentId>>,
    request_ids: RequestIdGenerator,
    self_weak: Weak<Self>,
}

impl<B, P, T> ServerSync<B, P, T>
where
    B: DocBinding + 'static,
    P: ClientProvider<Operations = B::Operations, Snapshot = B::Snapshot> + 'static,
    T: Transport<B::Operations, B::Snapshot> + 'static,
{
    pub fn new(binding: Arc<B>, provider: Arc<P>, transport: Arc<T>, doc_store: Arc<DocStore<B, P>>) -> Arc<Self> {
        let this = Arc::new_cyclic(|weak| Self {
            binding,
            provider,
            transport,
            doc_store,
            states: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashSet::new()),
            request_ids: RequestIdGenerator::new(),
            self_weak: weak.clone(),
        });

        let reconnect = Arc::clone(&this);
        this.transport.on_connect(Box::new(move || {
            let reconnect = Arc::clone(&reconnect);
            tokio::spawn(async move { reconnect.replay_subscriptions().await });
        }));

        let dirty = Arc::clone(&this);
        this.transport.on_push(Box::new(move |msg| {
            if let ServerMessage::Dirty { doc_id } = msg {
                let dirty = Arc::clone(&dirty);
                tokio::spawn(async move { dirty.save_remote(doc_id, true).await });
            }
        }));

        this
    }

    /// Track `doc_id` as subscribed and send the `Subscribe` RPC if the
    /// transport is up (ignored on failure; reconnect replays it).
    pub async fn subscribe_doc(&self, doc_id: DocumentId) {
        self.subscriptions.lock().await.insert(doc_id);
        let request_id = self.request_ids.next();
        let _ = self.transport.request(ClientMessage::Subscribe { request_id, doc_id }).await;
    }

    pub async fn unsubscribe_doc(&self, doc_id: DocumentId) {
        self.subscriptions.lock().await.remove(&doc_id);
        let request_id = self.request_ids.next();
        let _ = self.transport.request(ClientMessage::Unsubscribe { request_id, doc_id }).await;
    }

    async fn replay_subscriptions(self: Arc<Self>) {
        let doc_ids: Vec<DocumentId> = self.subscriptions.lock().await.iter().copied().collect();
        for doc_id in doc_ids {
            let request_id = self.request_ids.next();
            let _ = self.transport.request(ClientMessage::Subscribe { request_id, doc_id }).await;
            self.save_remote(doc_id, true).await;
        }
    }

    /// Append a locally-authored `batch` to the ops log for `doc_id` inside
    /// one transaction, then kick off a push (spec §4.3.1).
    async fn append_and_push(self: Arc<Self>, doc_id: DocumentId, batch: B::Operations) {
        if let Ok(mut tx) = self.provider.begin(TransactionMode::ReadWrite).await {
            if tx.save_operations(doc_id, vec![batch]).await.is_ok() {
                let _ = tx.commit().await;
            }
        }
        self.save_remote(doc_id, false).await;
    }

    /// The three-state push scheduler (spec §4.3.2): at most one in-flight
    /// push per doc_id (I4), later calls while a push is in flight are
    /// coalesced into a single follow-up push.
    async fn save_remote(self: &Arc<Self>, doc_id: DocumentId, forced: bool) {
        let mut states = self.states.lock().await;
        let state = states.entry(doc_id).or_insert(PushState::Idle);
        match state {
            PushState::Idle => {
                *state = PushState::Pushing;
                drop(states);
                let this = Arc::clone(self);
                tokio::spawn(async move { this.do_push(doc_id, forced).await });
            }
            PushState::Pushing => {
                *state = PushState::PushingWithPending;
            }
            PushState::PushingWithPending => {}
        }
    }

    /// Run one push/pull round-trip, retrying transport errors with
    /// full-jitter backoff, then loop once more if a `save_remote` call
    /// landed while this one was in flight (spec §4.3.3, §4.3.6).
    async fn do_push(self: Arc<Self>, doc_id: DocumentId, mut forced: bool) {
        let mut attempt: u32 = 0;
        loop {
            let (batches, clock) = match self.read_pending(doc_id).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(%doc_id, error = %e, "failed to read local op log for push");
                    self.finish_or_loop(doc_id).await;
                    return;
                }
            };

            if batches.is_empty() && !forced {
                self.finish_or_loop(doc_id).await;
                return;
            }

            let request_id = self.request_ids.next();
            let operations = if batches.is_empty() { None } else { Some(batches.clone()) };
            let msg = ClientMessage::SyncOperations { request_id, doc_id, operations, clock };

            match self.transport.request(msg).await {
                Ok(ServerMessage::SyncOperationsResult { clock: new_clock, operations, serialized_doc, .. }) => {
                    self.consolidate(doc_id, batches.len(), new_clock, operations, serialized_doc).await;
                    forced = false;
                    attempt = 0;
                    self.finish_or_loop(doc_id).await;
                    return;
                }
                Ok(ServerMessage::Error { error, .. }) => {
                    warn!(%doc_id, %error, "push rejected by relay");
                    self.finish_or_loop(doc_id).await;
                    return;
                }
                Ok(_) => {
                    warn!(%doc_id, "unexpected response to sync-operations");
                    self.finish_or_loop(doc_id).await;
                    return;
                }
                Err(e) => {
                    self.retry_after_transport_error(doc_id, e, attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn retry_after_transport_error(&self, doc_id: DocumentId, err: TransportError, attempt: u32) {
        if attempt + 1 >= WARN_AFTER_ATTEMPTS {
            warn!(%doc_id, %err, attempt, "push still failing after repeated retries");
        }
        let delay = crate::transport_ws::full_jitter_backoff(attempt, BASE_BACKOFF, MAX_BACKOFF);
        tokio::time::sleep(delay).await;
    }

    async fn read_pending(&self, doc_id: DocumentId) -> Result<(Vec<B::Operations>, crate::ids::Clock), crate::error::ProviderError> {
        let mut tx = self.provider.begin(TransactionMode::ReadOnly).await?;
        let batches = tx.get_operations(doc_id).await?;
        let clock = self.doc_store.stored_clock(doc_id).await.unwrap_or(0);
        Ok((batches, clock))
    }

    /// Step 5 of `do_push`: delete exactly the N ops just pushed, apply the
    /// server's response, and advance the stored clock (spec §4.3.3).
    async fn consolidate(
        &self,
        doc_id: DocumentId,
        pushed_count: usize,
        new_clock: crate::ids::Clock,
        operations: Vec<B::Operations>,
        serialized_doc: Option<B::Snapshot>,
    ) {
        let Ok(mut tx) = self.provider.begin(TransactionMode::ReadWrite).await else { return };
        let _ = tx.delete_operations(doc_id, pushed_count).await;

        if let Some(snapshot) = &serialized_doc {
            self.doc_store.apply_remote_snapshot(doc_id, snapshot).await;
            let _ = tx
                .save_serialized_doc(crate::provider::StoredDoc { doc_id, serialized_doc: snapshot.clone(), clock: new_clock })
                .await;
        } else {
            for batch in &operations {
                self.doc_store.apply_remote_batch(doc_id, batch).await;
            }
            if let Some(doc) = self.doc_store.cached_doc(doc_id).await {
                let doc = doc.lock().await;
                let snapshot = self.binding.serialize(&doc);
                let _ = tx
                    .save_serialized_doc(crate::provider::StoredDoc { doc_id, serialized_doc: snapshot, clock: new_clock })
                    .await;
            }
        }

        let _ = tx.commit().await;
    }

    async fn finish_or_loop(self: &Arc<Self>, doc_id: DocumentId) {
        let mut states = self.states.lock().await;
        match states.get(&doc_id) {
            Some(PushState::PushingWithPending) => {
                states.insert(doc_id, PushState::Pushing);
                drop(states);
                let this = Arc::clone(self);
                tokio::spawn(async move { this.do_push(doc_id, false).await });
            }
            _ => {
                states.insert(doc_id, PushState::Idle);
            }
        }
    }

    pub async fn delete_doc(&self, doc_id: DocumentId) -> bool {
        let request_id = self.request_ids.next();
        match self.transport.request(ClientMessage::DeleteDoc { request_id, doc_id }).await {
            Ok(ServerMessage::DeleteDocResult { success, .. }) => success,
            _ => false,
        }
    }

    pub async fn send_presence(&self, doc_id: DocumentId, presence: serde_json::Value) {
        let request_id = self.request_ids.next();
        let _ = self.transport.request(ClientMessage::Presence { request_id, doc_id, presence }).await;
    }
}

impl<B, P, T> ServerSyncHandle<B::Operations> for ServerSync<B, P, T>
where
    B: DocBinding + 'static,
    P: ClientProvider<Operations = B::Operations, Snapshot = B::Snapshot> + 'static,
    T: Transport<B::Operations, B::Snapshot> + 'static,
{
    fn on_local_operations(&self, doc_id: DocumentId, batch: B::Operations) {
        let Some(this) = self.self_weak.upgrade() else { return };
        tokio::spawn(async move { this.append_and_push(doc_id, batch).await });
    }

    fn probe(&self, doc_id: DocumentId) {
        let Some(this) = self.self_weak.upgrade() else { return };
        tokio::spawn(async move {
            this.subscribe_doc(doc_id).await;
            this.save_remote(doc_id, true).await;
        });
    }

    fn unsubscribe(&self, doc_id: DocumentId) {
        let Some(this) = self.self_weak.upgrade() else { return };
        tokio::spawn(async move { this.unsubscribe_doc(doc_id).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::GetDocArgs;
    use crate::error::TransportError as TErr;
    use crate::ids::DocType;
    use crate::loro_binding::{LoroBinding, LoroOperations, LoroSnapshot};
    use crate::memory_provider::InMemoryClientProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-process transport that answers `SyncOperations` by echoing back
    /// an incremented clock and no further ops, recording call count.
    struct CountingTransport {
        calls: AtomicUsize,
    }

    impl CountingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl Transport<LoroOperations, LoroSnapshot> for CountingTransport {
        async fn request(
            &self,
            msg: ClientMessage<LoroOperations>,
        ) -> Result<ServerMessage<LoroOperations, LoroSnapshot>, TErr> {
            match msg {
                ClientMessage::SyncOperations { request_id, doc_id, clock, .. } => {
                    self.calls.fetch_add(1, Ordering::SeqCst);
                    Ok(ServerMessage::SyncOperationsResult {
                        request_id,
                        doc_id,
                        clock: clock + 1,
                        operations: Vec::new(),
                        serialized_doc: None,
                    })
                }
                other => Ok(ServerMessage::Ok { request_id: other.request_id() }),
            }
        }

        fn on_push(&self, _handler: Box<dyn Fn(ServerMessage<LoroOperations, LoroSnapshot>) + Send + Sync>) -> crate::binding::ListenerId {
            0
        }
        fn on_connect(&self, _handler: Box<dyn Fn() + Send + Sync>) -> crate::binding::ListenerId {
            0
        }
        fn remove_listener(&self, _id: crate::binding::ListenerId) {}
    }

    #[tokio::test]
    async fn local_edit_triggers_exactly_one_push_call() {
        let binding = Arc::new(LoroBinding::new(vec![DocType::new("note")], 1).unwrap());
        let provider = Arc::new(InMemoryClientProvider::<LoroOperations, LoroSnapshot>::new());
        let transport = CountingTransport::new();
        let doc_store = DocStore::new(binding.clone(), provider.clone(), None);
        let sync = ServerSync::new(binding.clone(), provider, transport.clone(), doc_store.clone());
        doc_store.set_sink(sync.clone());

        let result = doc_store
            .get_doc(GetDocArgs { doc_type: Some(DocType::new("note")), id: None, create_if_missing: true })
            .await
            .unwrap();
        let doc_id = result.doc_id;
        let doc = result.doc.unwrap();

        {
            let doc = doc.lock().await;
            let vv_before = binding.version(&doc);
            doc.doc().get_text("body").insert(0, "hi").unwrap();
            doc.doc().commit();
            binding.export_local_change(&doc, &vv_before);
        }

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(transport.calls.load(Ordering::SeqCst) >= 1);
    }
}
