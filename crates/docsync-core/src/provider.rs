//! ClientProvider and ServerProvider: the two persistence boundaries the
//! sync engine consumes without caring how they're implemented.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::ids::{Clock, DocumentId};

/// Whether a transaction only reads or may also write. Reference providers
/// use this purely as a hint; it does not change correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// The stored doc payload: `{ doc_id, serialized_doc, clock }` (spec §3).
#[derive(Debug, Clone)]
pub struct StoredDoc<S> {
    pub doc_id: DocumentId,
    pub serialized_doc: S,
    pub clock: Clock,
}

/// An open, atomic unit of work against a [`ClientProvider`].
///
/// All methods observe and mutate a single consistent view; nothing
/// committed by another transaction becomes visible until this one is
/// dropped. Call [`commit`](ClientTransaction::commit) to make this
/// transaction's own writes visible to subsequent transactions; dropping
/// without committing discards them.
///
/// Native implementations (e.g. a sqlite-backed provider behind a
/// `tokio::sync::Mutex`) are `Send`; a browser implementation built on
/// `IndexedDB` via `web-sys`/`JsFuture` is not, since `JsFuture` is `!Send`.
/// The trait drops the `Send` bound on `wasm32` for that reason, matching
/// the `cfg_attr` split the teacher uses for its own platform-spanning
/// traits.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait ClientTransaction {
    type Operations: Clone + Send + Sync;
    type Snapshot: Clone + Send + Sync;

    async fn get_serialized_doc(
        &mut self,
        doc_id: DocumentId,
    ) -> Result<Option<StoredDoc<Self::Snapshot>>, ProviderError>;

    async fn save_serialized_doc(
        &mut self,
        stored: StoredDoc<Self::Snapshot>,
    ) -> Result<(), ProviderError>;

    /// Operations for `doc_id`, ordered by insertion (FIFO push queue).
    async fn get_operations(
        &mut self,
        doc_id: DocumentId,
    ) -> Result<Vec<Self::Operations>, ProviderError>;

    async fn save_operations(
        &mut self,
        doc_id: DocumentId,
        operations: Vec<Self::Operations>,
    ) -> Result<(), ProviderError>;

    /// Delete the first `count` entries for `doc_id`, preserving any
    /// appended after the count was taken.
    async fn delete_operations(&mut self, doc_id: DocumentId, count: usize) -> Result<(), ProviderError>;

    async fn commit(self: Box<Self>) -> Result<(), ProviderError>;
}

/// Local, per-identity persistence (spec §4.5). Implementations must
/// namespace storage by `user_id` so distinct identities never collide on
/// the same device.
///
/// See [`ClientTransaction`] for why the `Send` bound drops on `wasm32`.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait ClientProvider: Send + Sync {
    type Operations: Clone + Send + Sync + 'static;
    type Snapshot: Clone + Send + Sync + 'static;

    /// Begin a transaction. All multi-operation work on a doc must happen
    /// inside one transaction so I1/I2/I3 (spec §3) hold even under
    /// concurrent callers.
    async fn begin(
        &self,
        mode: TransactionMode,
    ) -> Result<BoxedClientTransaction<Self::Operations, Self::Snapshot>, ProviderError>;
}

/// The boxed [`ClientTransaction`] returned by [`ClientProvider::begin`].
/// Carries `+ Send` on non-wasm32 so native callers may hold it across a
/// `tokio::spawn`ed future; dropped on wasm32 to match the `?Send`
/// `ClientTransaction` impls there (e.g. `JsFuture`-backed IndexedDB).
#[cfg(not(target_arch = "wasm32"))]
pub type BoxedClientTransaction<O, S> = Box<dyn ClientTransaction<Operations = O, Snapshot = S> + Send>;
#[cfg(target_arch = "wasm32")]
pub type BoxedClientTransaction<O, S> = Box<dyn ClientTransaction<Operations = O, Snapshot = S>>;

/// A push+pull request to a [`ServerProvider`] (spec §4.6).
#[derive(Debug, Clone)]
pub struct SyncRequest<O> {
    pub doc_id: DocumentId,
    /// `None` is the wire's `null`: a pure pull with no local ops to push.
    pub operations: Option<Vec<O>>,
    pub clock: Clock,
}

/// The response to a [`SyncRequest`]. Exactly one of `operations` or
/// `serialized_doc` is meaningful for a given response: ordinary responses
/// carry `operations` (possibly empty); a response crossing a squash
/// boundary carries `serialized_doc` instead and `operations` is empty.
#[derive(Debug, Clone)]
pub struct SyncResponse<O, S> {
    pub doc_id: DocumentId,
    pub clock: Clock,
    pub operations: Vec<O>,
    pub serialized_doc: Option<S>,
}

/// Server-side persistence (spec §4.6): atomic push+fetch under the
/// document's monotonic clock.
#[async_trait]
pub trait ServerProvider: Send + Sync {
    type Operations: Clone + Send + Sync + 'static;
    type Snapshot: Clone + Send + Sync + 'static;

    /// Perform the push+fetch atomically. Implementations must never
    /// return ops with `clock <= request.clock`, and a request whose clock
    /// predates a squash cutoff must receive `serialized_doc` rather than
    /// the (now-compacted) op range.
    async fn sync(
        &self,
        request: SyncRequest<Self::Operations>,
    ) -> Result<SyncResponse<Self::Operations, Self::Snapshot>, ProviderError>;

    /// Permanently remove a document's log and snapshot. Returns whether it
    /// existed. Backs the relay's `DeleteDoc` RPC.
    async fn delete(&self, doc_id: DocumentId) -> Result<bool, ProviderError>;
}
