//! DocBinding: the narrow, operation-oriented contract between the sync
//! engine and whatever document model a caller plugs in.
//!
//! The sync engine never inspects a document's internal shape; it only
//! calls through this trait. See `loro_binding` for a concrete, fully
//! functional implementation built on the `loro` CRDT library.

use crate::error::BindingError;
use crate::ids::{DocType, DocumentId};

/// Handle returned by [`DocBinding::on_change`]; pass back to
/// [`DocBinding::remove_listeners`]'s caller-side bookkeeping if a binding
/// ever needs to remove a single listener rather than all of them. The
/// sync engine only ever installs one listener per doc and only ever
/// removes all of them at once, so this is mostly documentation of intent.
pub type ListenerId = u64;

/// The document binding contract (spec §4.1).
///
/// All methods are pure except [`apply_operations`](DocBinding::apply_operations),
/// which mutates the doc and invokes any registered change handler.
pub trait DocBinding: Send + Sync {
    /// The live, in-memory document type.
    type Doc: Send + Sync;
    /// The serializable snapshot type, JSON-representable, carrying its own
    /// [`DocType`] tag.
    type Snapshot: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static;
    /// The opaque operation-batch type emitted by `on_change`.
    type Operations: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static;

    /// Allocate an empty doc of the registered `doc_type`. Generates a
    /// lowercase ULID if `id` is absent. Fails with
    /// [`BindingError::UnknownType`] if `doc_type` is not registered.
    fn new_doc(
        &self,
        doc_type: &DocType,
        id: Option<DocumentId>,
    ) -> Result<(Self::Doc, DocumentId), BindingError>;

    /// Produce a serializable snapshot including the embedded type tag.
    fn serialize(&self, doc: &Self::Doc) -> Self::Snapshot;

    /// Reconstruct a doc from a snapshot, reading the type from it. Fails
    /// with [`BindingError::UnknownType`] or [`BindingError::MalformedSnapshot`].
    fn deserialize(&self, snapshot: &Self::Snapshot) -> Result<Self::Doc, BindingError>;

    /// Apply an operation batch to `doc`. Idempotent relative to the
    /// conflict model; callers should still avoid double-apply.
    fn apply_operations(&self, doc: &mut Self::Doc, operations: &Self::Operations);

    /// Bulk-apply a full snapshot onto an *existing* doc, in place, without
    /// touching its change-listener subscription.
    ///
    /// This is the resolution of the §9 "listener lifecycle" open question:
    /// rather than replacing the cache entry's doc object when the server
    /// squashes (which would require re-installing a listener and risks a
    /// double-listener against other in-memory references), the squashed
    /// snapshot is imported directly into the doc already held by the
    /// cache.
    fn apply_snapshot(&self, doc: &mut Self::Doc, snapshot: &Self::Snapshot);

    /// Register a handler invoked exactly once per committed batch.
    /// Invocation must be suppressible via [`set_broadcast_enabled`](DocBinding::set_broadcast_enabled)
    /// without unregistering the handler.
    fn on_change(&self, doc: &Self::Doc, handler: Box<dyn Fn(Self::Operations) + Send + Sync>) -> ListenerId;

    /// Toggle the doc's `should_broadcast` flag (spec §4.2.2): while
    /// disabled, `on_change` handlers still fire on `apply_operations` but
    /// the caller (DocStore) must not re-broadcast or re-push them. The
    /// binding itself does not interpret this flag; it is a piece of state
    /// the binding stores alongside the doc for the caller to flip.
    fn set_broadcast_enabled(&self, doc: &Self::Doc, enabled: bool);

    /// Clear all handlers; called at cache eviction.
    fn remove_listeners(&self, doc: &Self::Doc);
}

/// Shared helper for binding constructors: reject a set of doc-type names
/// containing a duplicate, per the spec's `DuplicateType` construction-time
/// failure.
pub fn check_no_duplicate_types<'a>(
    types: impl IntoIterator<Item = &'a DocType>,
) -> Result<(), BindingError> {
    let mut seen = std::collections::HashSet::new();
    for t in types {
        if !seen.insert(t.as_str()) {
            return Err(BindingError::DuplicateType(t.as_str().to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_duplicates_passes_distinct_types() {
        let types = vec![DocType::new("indexDoc"), DocType::new("noteDoc")];
        assert!(check_no_duplicate_types(types.iter()).is_ok());
    }

    #[test]
    fn duplicate_type_name_is_rejected() {
        let types = vec![DocType::new("indexDoc"), DocType::new("indexDoc")];
        let err = check_no_duplicate_types(types.iter()).unwrap_err();
        assert!(matches!(err, BindingError::DuplicateType(t) if t == "indexDoc"));
    }
}
