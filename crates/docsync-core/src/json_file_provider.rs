//! `JsonFileClientProvider`: a native-only, on-disk [`ClientProvider`].
//!
//! One JSON file per user at `{base_dir}/docsync-{user_id}/store.json`,
//! read-modify-write-fsync under a `tokio::sync::Mutex` for the duration of
//! each transaction (spec §4.5.1), directly grounded on the teacher's
//! `PeerStorage` (`sync-daemon/src/persistence.rs`): load the whole file on
//! open, buffer writes in memory, rewrite the whole file on save.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::ProviderError;
use crate::ids::DocumentId;
use crate::provider::{ClientProvider, ClientTransaction, StoredDoc, TransactionMode};

#[derive(Serialize, Deserialize)]
struct StoredDocOnDisk<S> {
    serialized_doc: S,
    clock: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "O: Serialize, S: Serialize",
    deserialize = "O: serde::Deserialize<'de>, S: serde::Deserialize<'de>"
))]
struct FileContents<O, S> {
    #[serde(default)]
    docs: HashMap<DocumentId, StoredDocOnDisk<S>>,
    #[serde(default)]
    operations: HashMap<DocumentId, Vec<O>>,
}

impl<O, S> Default for FileContents<O, S> {
    fn default() -> Self {
        Self {
            docs: HashMap::new(),
            operations: HashMap::new(),
        }
    }
}

async fn load<O: DeserializeOwned, S: DeserializeOwned>(path: &Path) -> Result<FileContents<O, S>, ProviderError> {
    match fs::read_to_string(path).await {
        Ok(contents) => serde_json::from_str(&contents).map_err(|e| ProviderError::Storage(e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileContents::default()),
        Err(e) => Err(ProviderError::Storage(e.to_string())),
    }
}

async fn save<O: Serialize, S: Serialize>(path: &Path, contents: &FileContents<O, S>) -> Result<(), ProviderError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| ProviderError::Storage(e.to_string()))?;
    }
    let json = serde_json::to_vec_pretty(contents).map_err(|e| ProviderError::Storage(e.to_string()))?;
    let mut file = fs::File::create(path).await.map_err(|e| ProviderError::Storage(e.to_string()))?;
    file.write_all(&json).await.map_err(|e| ProviderError::Storage(e.to_string()))?;
    file.sync_all().await.map_err(|e| ProviderError::Storage(e.to_string()))?;
    Ok(())
}

/// `ClientProvider` backed by one JSON file per user. Namespaced by
/// `user_id` per spec §4.5 so distinct identities sharing a device never
/// collide on the same file.
pub struct JsonFileClientProvider<O, S> {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
    _marker: PhantomData<(O, S)>,
}

impl<O, S> JsonFileClientProvider<O, S> {
    /// Does not touch the filesystem; the store file is created lazily by
    /// the first committed transaction.
    pub fn new(base_dir: impl Into<PathBuf>, user_id: &str) -> Self {
        let path = base_dir.into().join(format!("docsync-{user_id}")).join("store.json");
        Self {
            path,
            lock: Arc::new(Mutex::new(())),
            _marker: PhantomData,
        }
    }
}

/// An open transaction against [`JsonFileClientProvider`]. Holds the
/// provider's lock for its entire lifetime, loads the file's contents once
/// on open, and buffers writes like [`crate::memory_provider::InMemoryClientTransaction`];
/// [`commit`](ClientTransaction::commit) rewrites the whole file in one
/// fsynced write.
pub struct JsonFileClientTransaction<O: Clone + Send + Sync, S: Clone + Send + Sync> {
    _guard: OwnedMutexGuard<()>,
    path: PathBuf,
    base: FileContents<O, S>,
    pending_docs: HashMap<DocumentId, StoredDoc<S>>,
    pending_ops: HashMap<DocumentId, Vec<O>>,
}

impl<O: Clone + Send + Sync, S: Clone + Send + Sync> JsonFileClientTransaction<O, S> {
    fn current_operations(&self, doc_id: DocumentId) -> Vec<O> {
        self.pending_ops
            .get(&doc_id)
            .cloned()
            .or_else(|| self.base.operations.get(&doc_id).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl<O, S> ClientTransaction for JsonFileClientTransaction<O, S>
where
    O: Clone + Serialize + Send + Sync,
    S: Clone + Serialize + Send + Sync,
{
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
        Ok(self.base.docs.get(&doc_id).map(|d| StoredDoc {
            doc_id,
            serialized_doc: d.serialized_doc.clone(),
            clock: d.clock,
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
            self.base.docs.insert(
                doc_id,
                StoredDocOnDisk {
                    serialized_doc: stored.serialized_doc,
                    clock: stored.clock,
                },
            );
        }
        for (doc_id, ops) in self.pending_ops.drain() {
            self.base.operations.insert(doc_id, ops);
        }
        save(&self.path, &self.base).await
    }
}

#[async_trait]
impl<O, S> ClientProvider for JsonFileClientProvider<O, S>
where
    O: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Operations = O;
    type Snapshot = S;

    async fn begin(
        &self,
        _mode: TransactionMode,
    ) -> Result<crate::provider::BoxedClientTransaction<O, S>, ProviderError> {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        let base = load::<O, S>(&self.path).await?;
        Ok(Box::new(JsonFileClientTransaction {
            _guard: guard,
            path: self.path.clone(),
            base,
            pending_docs: HashMap::new(),
            pending_ops: HashMap::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_survive_a_fresh_provider_instance() {
        let dir = TempDir::new().unwrap();
        let doc_id = DocumentId::generate();

        {
            let provider: JsonFileClientProvider<String, String> =
                JsonFileClientProvider::new(dir.path(), "alice");
            let mut tx = provider.begin(TransactionMode::ReadWrite).await.unwrap();
            tx.save_operations(doc_id, vec!["a".into(), "b".into()]).await.unwrap();
            tx.save_serialized_doc(StoredDoc {
                doc_id,
                serialized_doc: "snapshot-1".to_string(),
                clock: 2,
            })
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }

        let path = dir.path().join("docsync-alice").join("store.json");
        assert!(path.exists(), "store.json must exist after a committed transaction");

        let provider: JsonFileClientProvider<String, String> =
            JsonFileClientProvider::new(dir.path(), "alice");
        let mut tx = provider.begin(TransactionMode::ReadOnly).await.unwrap();
        let ops = tx.get_operations(doc_id).await.unwrap();
        assert_eq!(ops, vec!["a".to_string(), "b".to_string()]);
        let stored = tx.get_serialized_doc(doc_id).await.unwrap().unwrap();
        assert_eq!(stored.serialized_doc, "snapshot-1");
        assert_eq!(stored.clock, 2);
    }

    #[tokio::test]
    async fn uncommitted_transaction_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let doc_id = DocumentId::generate();

        let provider: JsonFileClientProvider<String, String> =
            JsonFileClientProvider::new(dir.path(), "bob");
        let mut tx = provider.begin(TransactionMode::ReadWrite).await.unwrap();
        tx.save_operations(doc_id, vec!["uncommitted".into()]).await.unwrap();
        drop(tx);

        let mut tx2 = provider.begin(TransactionMode::ReadOnly).await.unwrap();
        let ops = tx2.get_operations(doc_id).await.unwrap();
        assert!(ops.is_empty());
    }

    #[tokio::test]
    async fn distinct_users_are_namespaced_to_distinct_files() {
        let dir = TempDir::new().unwrap();
        let doc_id = DocumentId::generate();

        let alice: JsonFileClientProvider<String, String> = JsonFileClientProvider::new(dir.path(), "alice");
        let mut tx = alice.begin(TransactionMode::ReadWrite).await.unwrap();
        tx.save_operations(doc_id, vec!["alice-op".into()]).await.unwrap();
        tx.commit().await.unwrap();

        let bob: JsonFileClientProvider<String, String> = JsonFileClientProvider::new(dir.path(), "bob");
        let mut tx = bob.begin(TransactionMode::ReadOnly).await.unwrap();
        let ops = tx.get_operations(doc_id).await.unwrap();
        assert!(ops.is_empty(), "bob's store must not see alice's operations");
    }
}
