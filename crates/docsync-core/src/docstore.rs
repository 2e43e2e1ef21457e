//! DocStore: the process-local in-memory doc cache (spec §4.2).
//!
//! Grounded on the teacher's `Vault<F>` (owns a `HashMap` of live documents,
//! loaded lazily from a durable backing store) generalized from one
//! hardcoded markdown schema to any registered [`DocBinding`], plus
//! `events.rs`'s "clone the callback list before invoking" idiom reused
//! here for the change-listener wiring.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::binding::DocBinding;
use crate::error::{ProviderError, SyncError};
use crate::ids::{Clock, DocType, DocumentId};
use crate::provider::{ClientProvider, ClientTransaction, StoredDoc, TransactionMode};

/// The subset of `ServerSync` that `DocStore` depends on. Kept as a trait
/// so `DocStore<B, P>` does not also need to carry a `Transport` generic
/// parameter just to notify its sync layer of local edits.
pub trait ServerSyncHandle<O>: Send + Sync {
    /// Record a locally-authored operation batch and kick off its push.
    /// Implementations spawn the actual append+push as a background task;
    /// this call itself must not block.
    fn on_local_operations(&self, doc_id: DocumentId, batch: O);

    /// Subscribe (if not already) and trigger a catch-up pull — the
    /// "probing push" every `get_doc` performs (spec §4.2).
    fn probe(&self, doc_id: DocumentId);

    /// Drop the subscription for a doc whose last cache reference just
    /// went away.
    fn unsubscribe(&self, doc_id: DocumentId);
}

/// Cross-process broadcast payload (spec §4.2.3, §6 "Cross-process
/// channel"). Posted to `docsync:{user_id}` whenever a cache entry applies
/// a locally-originated batch, so sibling processes for the same user
/// apply it too instead of re-deriving it from the server.
#[derive(Debug, Clone)]
pub struct BroadcastMessage<O> {
    pub doc_id: DocumentId,
    pub operations: O,
}

/// Joins (creating if absent) the process-wide `docsync:{user_id}`
/// broadcast channel for operations of type `O`. The sender is kept alive
/// by the registry, not by subscriber count, so a transient
/// zero-subscriber window does not tear the channel down.
///
/// Keyed on `(TypeId, user_id)` rather than `user_id` alone since one
/// process may in principle host `DocStore`s over more than one binding's
/// `Operations` type; downcasting is internal and never observable.
pub fn broadcast_channel<O>(user_id: &str) -> broadcast::Sender<BroadcastMessage<O>>
where
    O: Clone + Send + Sync + 'static,
{
    use std::any::{Any, TypeId};
    use std::sync::{Mutex, OnceLock};

    static REGISTRY: OnceLock<Mutex<HashMap<(TypeId, String), Box<dyn Any + Send>>>> = OnceLock::new();
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = registry.lock().unwrap();
    let key = (TypeId::of::<O>(), user_id.to_string());
    let entry = guard.entry(key).or_insert_with(|| {
        let (tx, _rx) = broadcast::channel::<BroadcastMessage<O>>(256);
        Box::new(tx)
    });
    entry
        .downcast_ref::<broadcast::Sender<BroadcastMessage<O>>>()
        .expect("broadcast registry key collision across distinct Operations types")
        .clone()
}

struct DocCacheEntry<B: DocBinding> {
    doc: Arc<AsyncMutex<B::Doc>>,
    doc_type: DocType,
    ref_count: usize,
}

/// Result of [`DocStore::get_doc`]: the resolved id, and the live doc if
/// one exists (or was just created).
pub struct GetDocResult<B: DocBinding> {
    pub doc_id: DocumentId,
    pub doc: Option<Arc<AsyncMutex<B::Doc>>>,
}

/// Arguments to [`DocStore::get_doc`] (spec §4.2).
#[derive(Debug, Clone, Default)]
pub struct GetDocArgs {
    pub doc_type: Option<DocType>,
    pub id: Option<DocumentId>,
    pub create_if_missing: bool,
}

/// The process-local in-memory doc cache. One entry per live doc_id,
/// ref-counted across concurrent `get_doc` subscribers (spec P6/P7).
pub struct DocStore<B, P>
where
    B: DocBinding,
    P: ClientProvider<Operations = B::Operations, Snapshot = B::Snapshot>,
{
    binding: Arc<B>,
    provider: Arc<P>,
    broadcast_tx: Option<broadcast::Sender<BroadcastMessage<B::Operations>>>,
    sink: std::sync::Mutex<Option<Arc<dyn ServerSyncHandle<B::Operations>>>>,
    slots: AsyncMutex<HashMap<DocumentId, Arc<AsyncMutex<Option<DocCacheEntry<B>>>>>>,
    self_weak: std::sync::Weak<Self>,
}

impl<B, P> DocStore<B, P>
where
    B: DocBinding + 'static,
    P: ClientProvider<Operations = B::Operations, Snapshot = B::Snapshot> + 'static,
{
    pub fn new(binding: Arc<B>, provider: Arc<P>, broadcast_tx: Option<broadcast::Sender<BroadcastMessage<B::Operations>>>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            binding,
            provider,
            broadcast_tx,
            sink: std::sync::Mutex::new(None),
            slots: AsyncMutex::new(HashMap::new()),
            self_weak: weak.clone(),
        })
    }

    /// Wire in the sync layer after construction, breaking the
    /// `DocStore`/`ServerSync` reference cycle: `ServerSync` holds a strong
    /// `Arc<DocStore<_>>`, so `DocStore` only ever holds the sink as a
    /// type-erased trait object set once by the caller that built both.
    pub fn set_sink(&self, sink: Arc<dyn ServerSyncHandle<B::Operations>>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn sink(&self) -> Option<Arc<dyn ServerSyncHandle<B::Operations>>> {
        self.sink.lock().unwrap().clone()
    }

    async fn slot_for(&self, doc_id: DocumentId) -> Arc<AsyncMutex<Option<DocCacheEntry<B>>>> {
        self.slots
            .lock()
            .await
            .entry(doc_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// Load-or-create a doc inside a single local transaction (spec
    /// §4.2.1). Concurrent `get_doc` calls for the same id serialize on
    /// the per-doc slot lock, which both implements "share the in-flight
    /// load" and keeps `ref_count` bookkeeping race-free (P6).
    pub async fn get_doc(&self, args: GetDocArgs) -> Result<GetDocResult<B>, SyncError> {
        let doc_id = args.id.unwrap_or_else(DocumentId::generate);
        let slot = self.slot_for(doc_id).await;
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_mut() {
            entry.ref_count += 1;
            let doc = entry.doc.clone();
            drop(guard);
            if let Some(sink) = self.sink() {
                sink.probe(doc_id);
            }
            return Ok(GetDocResult { doc_id, doc: Some(doc) });
        }

        let mut tx = self.provider.begin(TransactionMode::ReadWrite).await?;
        let stored = tx.get_serialized_doc(doc_id).await?;
        let ops = tx.get_operations(doc_id).await?;

        let doc = match stored {
            Some(StoredDoc { serialized_doc, .. }) => {
                let mut doc = self.binding.deserialize(&serialized_doc)?;
                self.binding.set_broadcast_enabled(&doc, false);
                for batch in &ops {
                    self.binding.apply_operations(&mut doc, batch);
                }
                self.binding.set_broadcast_enabled(&doc, true);
                Some(doc)
            }
            None if args.create_if_missing => {
                if !ops.is_empty() {
                    return Err(ProviderError::OrphanOps(doc_id.to_string()).into());
                }
                let doc_type = args
                    .doc_type
                    .clone()
                    .ok_or_else(|| SyncError::Environment("create_if_missing requires a doc_type".into()))?;
                let (doc, _) = self.binding.new_doc(&doc_type, Some(doc_id))?;
                let snapshot = self.binding.serialize(&doc);
                tx.save_serialized_doc(StoredDoc { doc_id, serialized_doc: snapshot, clock: 0 }).await?;
                Some(doc)
            }
            None => None,
        };
        tx.commit().await?;

        let doc = match doc {
            Some(doc) => doc,
            None => return Ok(GetDocResult { doc_id, doc: None }),
        };

        let doc_type = args.doc_type.clone().unwrap_or_else(|| DocType::new(""));
        self.install_change_listener(doc_id, &doc);
        let doc = Arc::new(AsyncMutex::new(doc));
        *guard = Some(DocCacheEntry { doc: doc.clone(), doc_type, ref_count: 1 });
        drop(guard);

        if let Some(sink) = self.sink() {
            sink.probe(doc_id);
        }

        Ok(GetDocResult { doc_id, doc: Some(doc) })
    }

    fn install_change_listener(&self, doc_id: DocumentId, doc: &B::Doc) {
        let broadcast_tx = self.broadcast_tx.clone();
        let self_weak = self.self_weak.clone();
        self.binding.on_change(
            doc,
            Box::new(move |batch: B::Operations| {
                if let Some(tx) = &broadcast_tx {
                    let _ = tx.send(BroadcastMessage { doc_id, operations: batch.clone() });
                }
                // Resolved dynamically rather than captured at install time:
                // `get_doc` may load a doc before `set_sink` runs.
                if let Some(this) = self_weak.upgrade() {
                    if let Some(sink) = this.sink() {
                        sink.on_local_operations(doc_id, batch);
                    }
                }
            }),
        );
    }

    /// Apply a batch received over the broadcast channel or as a server
    /// response, with `should_broadcast` suppressed so it is never re-
    /// pushed (spec P8).
    pub async fn apply_remote_batch(&self, doc_id: DocumentId, batch: &B::Operations) {
        let Some(slot) = self.slots.lock().await.get(&doc_id).cloned() else { return };
        let guard = slot.lock().await;
        let Some(entry) = guard.as_ref() else { return };
        let doc = entry.doc.clone();
        drop(guard);
        let mut doc = doc.lock().await;
        self.binding.set_broadcast_enabled(&doc, false);
        self.binding.apply_operations(&mut doc, batch);
        self.binding.set_broadcast_enabled(&doc, true);
    }

    /// Bulk-apply a squashed snapshot onto the cached doc in place (spec §9
    /// "Listener lifecycles", decision (b)). No-op if the doc is not cached.
    pub async fn apply_remote_snapshot(&self, doc_id: DocumentId, snapshot: &B::Snapshot) {
        let Some(slot) = self.slots.lock().await.get(&doc_id).cloned() else { return };
        let guard = slot.lock().await;
        let Some(entry) = guard.as_ref() else { return };
        let doc = entry.doc.clone();
        drop(guard);
        let mut doc = doc.lock().await;
        self.binding.set_broadcast_enabled(&doc, false);
        self.binding.apply_snapshot(&mut doc, snapshot);
        self.binding.set_broadcast_enabled(&doc, true);
    }

    pub async fn cached_doc(&self, doc_id: DocumentId) -> Option<Arc<AsyncMutex<B::Doc>>> {
        let slot = self.slots.lock().await.get(&doc_id)?.clone();
        let guard = slot.lock().await;
        guard.as_ref().map(|e| e.doc.clone())
    }

    pub async fn stored_clock(&self, doc_id: DocumentId) -> Result<Clock, SyncError> {
        let mut tx = self.provider.begin(TransactionMode::ReadOnly).await?;
        Ok(tx.get_serialized_doc(doc_id).await?.map(|s| s.clock).unwrap_or(0))
    }

    /// Decrement `ref_count`; on zero, remove the cache entry, clear the
    /// binding's listeners, and tell the sync layer to drop the
    /// subscription (spec P7).
    pub async fn unsubscribe(&self, doc_id: DocumentId) {
        let Some(slot) = self.slots.lock().await.get(&doc_id).cloned() else { return };
        let mut guard = slot.lock().await;
        let Some(entry) = guard.as_mut() else { return };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return;
        }
        let doc = entry.doc.clone();
        let taken = guard.take();
        drop(guard);
        drop(taken);
        {
            let doc = doc.lock().await;
            self.binding.remove_listeners(&doc);
        }
        self.slots.lock().await.remove(&doc_id);
        if let Some(sink) = self.sink() {
            sink.unsubscribe(doc_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::DocType;
    use crate::loro_binding::LoroBinding;
    use crate::memory_provider::InMemoryClientProvider;

    fn store() -> Arc<DocStore<LoroBinding, InMemoryClientProvider<crate::loro_binding::LoroOperations, crate::loro_binding::LoroSnapshot>>> {
        let binding = Arc::new(LoroBinding::new(vec![DocType::new("note")], 1).unwrap());
        let provider = Arc::new(InMemoryClientProvider::new());
        DocStore::new(binding, provider, None)
    }

    #[tokio::test]
    async fn create_if_missing_allocates_and_caches() {
        let store = store();
        let result = store
            .get_doc(GetDocArgs { doc_type: Some(DocType::new("note")), id: None, create_if_missing: true })
            .await
            .unwrap();
        assert!(result.doc.is_some());
    }

    #[tokio::test]
    async fn missing_doc_without_create_returns_none() {
        let store = store();
        let result = store
            .get_doc(GetDocArgs { doc_type: None, id: Some(DocumentId::generate()), create_if_missing: false })
            .await
            .unwrap();
        assert!(result.doc.is_none());
    }

    #[tokio::test]
    async fn concurrent_get_doc_shares_cache_entry_and_ref_counts() {
        let store = store();
        let first = store
            .get_doc(GetDocArgs { doc_type: Some(DocType::new("note")), id: None, create_if_missing: true })
            .await
            .unwrap();
        let doc_id = first.doc_id;

        let second = store
            .get_doc(GetDocArgs { doc_type: None, id: Some(doc_id), create_if_missing: false })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first.doc.unwrap(), &second.doc.unwrap()));

        store.unsubscribe(doc_id).await;
        assert!(store.cached_doc(doc_id).await.is_some(), "one ref left after first unsubscribe");
        store.unsubscribe(doc_id).await;
        assert!(store.cached_doc(doc_id).await.is_none(), "cache entry removed after last unsubscribe");
    }

    #[tokio::test]
    async fn orphan_ops_without_snapshot_is_rejected() {
        let binding = Arc::new(LoroBinding::new(vec![DocType::new("note")], 1).unwrap());
        let provider = Arc::new(InMemoryClientProvider::<crate::loro_binding::LoroOperations, crate::loro_binding::LoroSnapshot>::new());
        let doc_id = DocumentId::generate();
        {
            let mut tx = provider.begin(TransactionMode::ReadWrite).await.unwrap();
            tx.save_operations(doc_id, vec![crate::loro_binding::LoroOperations { doc_type: DocType::new("note"), bytes: vec![1, 2, 3] }])
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }
        let store = DocStore::new(binding, provider, None);
        let err = store
            .get_doc(GetDocArgs { doc_type: Some(DocType::new("note")), id: Some(doc_id), create_if_missing: true })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Provider(ProviderError::OrphanOps(_))));
    }
}
