//! In-memory reference implementations of [`ClientProvider`] and
//! [`ServerProvider`], modeled on the teacher's `InMemoryFs`
//! (`RwLock<HashMap<...>>`, reference-counted sharing via `Arc`).
//!
//! `InMemoryClientProvider` backs every unit test in this workspace.
//! `InMemoryServerProvider` backs the relay binary's default, non-durable
//! store and the scenario tests in `docsync-server/tests`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::ProviderError;
use crate::ids::{Clock, DocumentId};
use crate::provider::{
    ClientProvider, ClientTransaction, ServerProvider, StoredDoc, SyncRequest, SyncResponse,
    TransactionMode,
};

// ===========================================================================
// InMemoryClientProvider
// ===========================================================================

struct ClientState<O, S> {
    docs: HashMap<DocumentId, StoredDoc<S>>,
    operations: HashMap<DocumentId, Vec<O>>,
}

impl<O, S> Default for ClientState<O, S> {
    fn default() -> Self {
        Self {
            docs: HashMap::new(),
            operations: HashMap::new(),
        }
    }
}

/// `ClientProvider` backed by process memory. Not durable across restarts;
/// intended for tests and for callers who supply their own durable
/// provider.
pub struct InMemoryClientProvider<O, S> {
    state: Arc<Mutex<ClientState<O, S>>>,
}

impl<O, S> Default for InMemoryClientProvider<O, S> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClientState::default())),
        }
    }
}

impl<O, S> InMemoryClientProvider<O, S> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<O, S> Clone for InMemoryClientProvider<O, S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

/// An open transaction against [`InMemoryClientProvider`]. Holds the
/// provider's lock for its entire lifetime (satisfying the "single
/// transaction" atomicity the spec requires); writes are buffered and only
/// merged into the shared state on [`commit`](ClientTransaction::commit),
/// so a dropped, uncommitted transaction leaves no trace.
pub struct InMemoryClientTransaction<O: Clone + Send + Sync, S: Clone + Send + Sync> {
    guard: OwnedMutexGuard<ClientState<O, S>>,
    pending_docs: HashMap<DocumentId, StoredDoc<S>>,
    pending_ops: HashMap<DocumentId, Vec<O>>,
}

impl<O: Clone + Send + Sync, S: Clone + Send + Sync> InMemoryClientTransaction<O, S> {
    fn current_operations(&self, doc_id: DocumentId) -> Vec<O> {
        self.pending_ops
            .get(&doc_id)
            .cloned()
            .or_else(|| self.guard.operations.get(&doc_id).cloned())
            .unwrap_or_default()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl<O: Clone + Send + Sync, S: Clone + Send + Sync> ClientTransaction for InMemoryClientTransaction<O, S> {
    type Operations = O;
    type Snapshot = S;

    async fn get_serialized_doc(
        &mut self,
        doc_id: DocumentId,
    ) -> Result<Option<StoredDoc<S>>, ProviderError> {
        if let Some(stored) = self.pending_docs.get(&doc_id) {
            return Ok(Some(StoredDoc {
                doc_id: stored.doc_id,
                serialized_doc: stored.serialized_doc.clone(),
                clock: stored.clock,
            }));
        }
        Ok(self.guard.docs.get(&doc_id).map(|s| StoredDoc {
            doc_id: s.doc_id,
            serialized_doc: s.serialized_doc.clone(),
            clock: s.clock,
        }))
    }

    async fn save_serialized_doc(&mut self, stored: StoredDoc<S>) -> Result<(), ProviderError> {
        self.pending_docs.insert(stored.doc_id, stored);
        Ok(())
    }

    async fn get_operations(&mut self, doc_id: DocumentId) -> Result<Vec<O>, ProviderError> {
        Ok(self.current_operations(doc_id))
    }

    async fn save_operations(
        &mut self,
        doc_id: DocumentId,
        operations: Vec<O>,
    ) -> Result<(), ProviderError> {
        let mut current = self.current_operations(doc_id);
        current.extend(operations);
        self.pending_ops.insert(doc_id, current);
        Ok(())
    }

    async fn delete_operations(&mut self, doc_id: DocumentId, count: usize) -> Result<(), ProviderError> {
        let mut current = self.current_operations(doc_id);
        let drain_to = count.min(current.len());
        current.drain(0..drain_to);
        self.pending_ops.insert(doc_id, current);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), ProviderError> {
        for (doc_id, stored) in self.pending_docs.drain() {
            self.guard.docs.insert(doc_id, stored);
        }
        for (doc_id, ops) in self.pending_ops.drain() {
            self.guard.operations.insert(doc_id, ops);
        }
        Ok(())
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl<O, S> ClientProvider for InMemoryClientProvider<O, S>
where
    O: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    type Operations = O;
    type Snapshot = S;

    async fn begin(
        &self,
        _mode: TransactionMode,
    ) -> Result<crate::provider::BoxedClientTransaction<O, S>, ProviderError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(InMemoryClientTransaction {
            guard,
            pending_docs: HashMap::new(),
            pending_ops: HashMap::new(),
        }))
    }
}

// ===========================================================================
// InMemoryServerProvider
// ===========================================================================

struct DocLog<O, S> {
    /// Ops accepted since the last squash, in clock order.
    operations: Vec<(Clock, O)>,
    /// The clock as of the most recent squash, and the snapshot it produced.
    squashed: Option<(Clock, S)>,
    clock: Clock,
}

impl<O, S> Default for DocLog<O, S> {
    fn default() -> Self {
        Self {
            operations: Vec::new(),
            squashed: None,
            clock: 0,
        }
    }
}

/// Merges accumulated operations onto an optional prior snapshot, producing
/// a new snapshot. This is the same work a [`crate::binding::DocBinding`]
/// would do via `apply_operations` + `serialize`, expressed as a plain
/// closure so the server provider doesn't need a full binding instance
/// (the relay never otherwise interprets operations).
pub type SquashFn<O, S> = Arc<dyn Fn(Option<&S>, &[O]) -> S + Send + Sync>;

/// `ServerProvider` backed by process memory, with server-side squashing
/// (spec §4.4.2, §4.6) once a doc's unsquashed op count reaches
/// `squash_threshold` (default 100, per §9).
pub struct InMemoryServerProvider<O, S> {
    logs: Mutex<HashMap<DocumentId, DocLog<O, S>>>,
    squash_threshold: usize,
    squash: SquashFn<O, S>,
}

impl<O, S> InMemoryServerProvider<O, S> {
    pub fn new(squash: SquashFn<O, S>) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            squash_threshold: 100,
            squash,
        }
    }

    pub fn with_squash_threshold(mut self, threshold: usize) -> Self {
        self.squash_threshold = threshold;
        self
    }
}

#[async_trait]
impl<O, S> ServerProvider for InMemoryServerProvider<O, S>
where
    O: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    type Operations = O;
    type Snapshot = S;

    async fn sync(
        &self,
        request: SyncRequest<O>,
    ) -> Result<SyncResponse<O, S>, ProviderError> {
        let mut logs = self.logs.lock().await;
        let log = logs.entry(request.doc_id).or_default();

        // Materialize a squash deferred from a previous call before touching
        // this request's own push, so the push that actually crosses
        // `squash_threshold` still responds with the pre-squash operations
        // (spec §4.4.2 step 3, §8 Scenario 4); only the next call to observe
        // the crossed threshold pays for compaction.
        if log.operations.len() >= self.squash_threshold {
            let base = log.squashed.as_ref().map(|(_, s)| s);
            let all_ops: Vec<O> = log.operations.iter().map(|(_, op)| op.clone()).collect();
            let snapshot = (self.squash)(base, &all_ops);
            log.squashed = Some((log.clock, snapshot));
            log.operations.clear();
        }

        let pre_push_clock = log.clock;

        if let Some(batches) = request.operations {
            for batch in batches {
                log.clock += 1;
                log.operations.push((log.clock, batch));
            }
        }

        // A client behind the squash cutoff must receive the snapshot, not
        // the (now-compacted) op range it predates.
        if let Some((squash_clock, snapshot)) = &log.squashed {
            if request.clock < *squash_clock {
                return Ok(SyncResponse {
                    doc_id: request.doc_id,
                    clock: log.clock,
                    operations: Vec::new(),
                    serialized_doc: Some(snapshot.clone()),
                });
            }
        }

        // Filter on the clock from *before* this call's own push, not just
        // `request.clock`: a pusher's own request clock still reflects the
        // state prior to this sync, so filtering on `request.clock` alone
        // would echo its own just-appended batch right back to it.
        let pending: Vec<O> = log
            .operations
            .iter()
            .filter(|(clock, _)| *clock > pre_push_clock.max(request.clock))
            .map(|(_, op)| op.clone())
            .collect();

        Ok(SyncResponse {
            doc_id: request.doc_id,
            clock: log.clock,
            operations: pending,
            serialized_doc: None,
        })
    }

    async fn delete(&self, doc_id: DocumentId) -> Result<bool, ProviderError> {
        Ok(self.logs.lock().await.remove(&doc_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_transaction_is_invisible_until_commit() {
        let provider: InMemoryClientProvider<String, String> = InMemoryClientProvider::new();
        let doc_id = DocumentId::generate();

        let mut tx = provider.begin(TransactionMode::ReadWrite).await.unwrap();
        tx.save_operations(doc_id, vec!["a".into()]).await.unwrap();
        // Not yet committed: a fresh transaction must not see it.
        let mut peek = provider.begin(TransactionMode::ReadOnly).await.unwrap();
        drop(peek_result_of(&mut peek, doc_id).await);
        drop(peek);
        tx.commit().await.unwrap();

        let mut tx2 = provider.begin(TransactionMode::ReadOnly).await.unwrap();
        let ops = tx2.get_operations(doc_id).await.unwrap();
        assert_eq!(ops, vec!["a".to_string()]);
    }

    async fn peek_result_of(
        tx: &mut crate::provider::BoxedClientTransaction<String, String>,
        doc_id: DocumentId,
    ) -> Vec<String> {
        tx.get_operations(doc_id).await.unwrap()
    }

    #[tokio::test]
    async fn delete_operations_preserves_later_appends() {
        let provider: InMemoryClientProvider<String, String> = InMemoryClientProvider::new();
        let doc_id = DocumentId::generate();

        let mut tx = provider.begin(TransactionMode::ReadWrite).await.unwrap();
        tx.save_operations(doc_id, vec!["a".into(), "b".into()]).await.unwrap();
        tx.commit().await.unwrap();

        // Simulate: push began with N=2, server accepted, then a new local
        // edit lands before consolidation deletes exactly 2.
        let mut tx = provider.begin(TransactionMode::ReadWrite).await.unwrap();
        tx.save_operations(doc_id, vec!["c".into()]).await.unwrap();
        tx.delete_operations(doc_id, 2).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = provider.begin(TransactionMode::ReadOnly).await.unwrap();
        let ops = tx.get_operations(doc_id).await.unwrap();
        assert_eq!(ops, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn server_squashes_after_threshold() {
        let squash: SquashFn<String, String> =
            Arc::new(|base, ops| format!("{}+{}", base.cloned().unwrap_or_default(), ops.join(",")));
        let provider = InMemoryServerProvider::new(squash).with_squash_threshold(3);
        let doc_id = DocumentId::generate();

        let resp = provider
            .sync(SyncRequest {
                doc_id,
                operations: Some(vec!["a".into(), "b".into(), "c".into()]),
                clock: 0,
            })
            .await
            .unwrap();
        assert_eq!(resp.clock, 3);

        // A client still behind the squash must get the snapshot.
        let resp2 = provider
            .sync(SyncRequest {
                doc_id,
                operations: None,
                clock: 0,
            })
            .await
            .unwrap();
        assert!(resp2.serialized_doc.is_some());
        assert!(resp2.operations.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_log_and_reports_prior_existence() {
        let squash: SquashFn<String, String> = Arc::new(|_, _| String::new());
        let provider = InMemoryServerProvider::new(squash);
        let doc_id = DocumentId::generate();

        assert!(!provider.delete(doc_id).await.unwrap());

        provider.sync(SyncRequest { doc_id, operations: Some(vec!["a".into()]), clock: 0 }).await.unwrap();
        assert!(provider.delete(doc_id).await.unwrap());
        assert!(!provider.delete(doc_id).await.unwrap(), "already gone");
    }

    #[tokio::test]
    async fn server_never_returns_ops_at_or_below_request_clock() {
        let squash: SquashFn<String, String> = Arc::new(|_, _| String::new());
        let provider = InMemoryServerProvider::new(squash);
        let doc_id = DocumentId::generate();

        provider
            .sync(SyncRequest { doc_id, operations: Some(vec!["a".into()]), clock: 0 })
            .await
            .unwrap();
        let resp = provider
            .sync(SyncRequest { doc_id, operations: None, clock: 1 })
            .await
            .unwrap();
        assert!(resp.operations.is_empty());
    }
}
