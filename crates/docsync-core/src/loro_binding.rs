//! LoroBinding: a reference [`DocBinding`] implementation built on the
//! `loro` CRDT library.
//!
//! Generalizes the teacher's `NoteDocument` (one hardcoded markdown schema
//! wrapping a single `LoroDoc`) into a type-registry that hands out empty
//! docs for any registered [`DocType`], leaving the document's internal
//! container layout entirely up to the caller.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use loro::{ExportMode, LoroDoc, VersionVector};
use serde::{Deserialize, Serialize};

use crate::binding::{check_no_duplicate_types, DocBinding, ListenerId};
use crate::error::BindingError;
use crate::ids::{DocType, DocumentId};

/// A batch of Loro update bytes, tagged with the doc's type so
/// `apply_operations` can be called without the caller separately tracking
/// which schema a given doc id uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoroOperations {
    pub doc_type: DocType,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

/// A full exported Loro snapshot, tagged with its doc type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoroSnapshot {
    pub doc_type: DocType,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// The live document handle `LoroBinding` hands back from `new_doc` and
/// `deserialize`. Holds the underlying `LoroDoc` plus the bookkeeping
/// `DocBinding::on_change`/`set_broadcast_enabled` need.
pub struct LoroHandle {
    doc: LoroDoc,
    doc_type: DocType,
    listeners: Mutex<HashMap<ListenerId, Box<dyn Fn(LoroOperations) + Send + Sync>>>,
    next_listener_id: AtomicU64,
    broadcast_enabled: AtomicBool,
}

impl LoroHandle {
    /// The live `LoroDoc`, for schema-specific code (outside this trait)
    /// to read or mutate containers directly. After any local mutation,
    /// the caller commits the doc and calls [`LoroBinding::export_local_change`]
    /// to produce the operation batch `on_change` handlers expect.
    pub fn doc(&self) -> &LoroDoc {
        &self.doc
    }

    fn notify(&self, batch: LoroOperations) {
        if !self.broadcast_enabled.load(Ordering::SeqCst) {
            return;
        }
        let listeners = self.listeners.lock().unwrap();
        for handler in listeners.values() {
            handler(batch.clone());
        }
    }
}

/// Reference [`DocBinding`] over `loro::LoroDoc`.
pub struct LoroBinding {
    peer_id: u64,
    types: HashSet<DocType>,
}

impl LoroBinding {
    /// `peer_id` seeds every doc this binding creates or imports into,
    /// matching `NoteDocument::new`'s "peer id must be set before any
    /// operations" requirement.
    pub fn new(
        types: impl IntoIterator<Item = DocType>,
        peer_id: u64,
    ) -> Result<Self, BindingError> {
        let types: Vec<DocType> = types.into_iter().collect();
        check_no_duplicate_types(types.iter())?;
        Ok(Self {
            peer_id,
            types: types.into_iter().collect(),
        })
    }

    fn require_registered(&self, doc_type: &DocType) -> Result<(), BindingError> {
        if self.types.contains(doc_type) {
            Ok(())
        } else {
            Err(BindingError::UnknownType(doc_type.as_str().to_string()))
        }
    }

    fn fresh_handle(&self, doc: LoroDoc, doc_type: DocType) -> LoroHandle {
        doc.set_peer_id(self.peer_id).ok();
        LoroHandle {
            doc,
            doc_type,
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(0),
            broadcast_enabled: AtomicBool::new(true),
        }
    }

    /// Export the updates committed to `doc` since `since`, firing any
    /// registered `on_change` handler with the resulting batch and
    /// returning it for the caller to push/broadcast itself.
    ///
    /// DocStore calls this immediately after a caller mutates the live
    /// doc returned by [`LoroHandle::doc`] and commits it; this is how
    /// `on_change` observes locally-originated edits, since this binding
    /// diffs by version vector rather than installing a native Loro
    /// change subscription.
    pub fn export_local_change(
        &self,
        handle: &LoroHandle,
        since: &VersionVector,
    ) -> Option<LoroOperations> {
        let bytes = handle.doc.export(ExportMode::updates(since)).ok()?;
        if bytes.is_empty() {
            return None;
        }
        let batch = LoroOperations {
            doc_type: handle.doc_type.clone(),
            bytes,
        };
        handle.notify(batch.clone());
        Some(batch)
    }

    pub fn version(&self, handle: &LoroHandle) -> VersionVector {
        handle.doc.state_vv()
    }
}

impl DocBinding for LoroBinding {
    type Doc = LoroHandle;
    type Snapshot = LoroSnapshot;
    type Operations = LoroOperations;

    fn new_doc(
        &self,
        doc_type: &DocType,
        id: Option<DocumentId>,
    ) -> Result<(Self::Doc, DocumentId), BindingError> {
        self.require_registered(doc_type)?;
        let doc_id = id.unwrap_or_else(DocumentId::generate);
        let doc = LoroDoc::new();
        let handle = self.fresh_handle(doc, doc_type.clone());
        handle.doc.commit();
        Ok((handle, doc_id))
    }

    fn serialize(&self, doc: &Self::Doc) -> Self::Snapshot {
        LoroSnapshot {
            doc_type: doc.doc_type.clone(),
            bytes: doc.doc.export(ExportMode::Snapshot).unwrap(),
        }
    }

    fn deserialize(&self, snapshot: &Self::Snapshot) -> Result<Self::Doc, BindingError> {
        self.require_registered(&snapshot.doc_type)?;
        let doc = LoroDoc::new();
        doc.import(&snapshot.bytes)
            .map_err(|e| BindingError::MalformedSnapshot(e.to_string()))?;
        Ok(self.fresh_handle(doc, snapshot.doc_type.clone()))
    }

    fn apply_operations(&self, doc: &mut Self::Doc, operations: &Self::Operations) {
        if doc.doc.import(&operations.bytes).is_ok() {
            doc.doc.commit();
            doc.notify(operations.clone());
        }
    }

    fn apply_snapshot(&self, doc: &mut Self::Doc, snapshot: &Self::Snapshot) {
        doc.doc.import(&snapshot.bytes).ok();
        doc.doc.commit();
    }

    fn on_change(&self, doc: &Self::Doc, handler: Box<dyn Fn(Self::Operations) + Send + Sync>) -> ListenerId {
        let id = doc.next_listener_id.fetch_add(1, Ordering::SeqCst);
        doc.listeners.lock().unwrap().insert(id, handler);
        id
    }

    fn set_broadcast_enabled(&self, doc: &Self::Doc, enabled: bool) {
        doc.broadcast_enabled.store(enabled, Ordering::SeqCst);
    }

    fn remove_listeners(&self, doc: &Self::Doc) {
        doc.listeners.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> LoroBinding {
        LoroBinding::new(vec![DocType::new("note")], 1).unwrap()
    }

    #[test]
    fn unregistered_type_is_rejected() {
        let binding = binding();
        let err = binding.new_doc(&DocType::new("other"), None).unwrap_err();
        assert!(matches!(err, BindingError::UnknownType(t) if t == "other"));
    }

    #[test]
    fn apply_operations_round_trips_through_snapshot() {
        let binding = binding();
        let (mut a, _) = binding.new_doc(&DocType::new("note"), None).unwrap();
        a.doc().get_text("body").insert(0, "hello").unwrap();
        a.doc().commit();
        let snap = binding.serialize(&a);

        let mut b = binding.deserialize(&snap).unwrap();
        assert_eq!(b.doc().get_text("body").to_string(), "hello");

        let vv_before = binding.version(&b);
        b.doc().get_text("body").insert(5, " world").unwrap();
        b.doc().commit();
        let ops = binding.export_local_change(&b, &vv_before).unwrap();

        a.doc().import(&ops.bytes).unwrap();
        assert_eq!(a.doc().get_text("body").to_string(), "hello world");
    }

    #[test]
    fn on_change_fires_once_per_committed_batch_and_is_suppressible() {
        let binding = binding();
        let (mut doc, _) = binding.new_doc(&DocType::new("note"), None).unwrap();
        let count = std::sync::Arc::new(AtomicU64::new(0));
        let count_clone = count.clone();
        binding.on_change(&doc, Box::new(move |_ops| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let other = binding();
        let (other_doc, _) = other.new_doc(&DocType::new("note"), None).unwrap();
        other_doc.doc().get_text("body").insert(0, "x").unwrap();
        other_doc.doc().commit();
        let snapshot = other.serialize(&other_doc);
        let remote_ops = LoroOperations {
            doc_type: DocType::new("note"),
            bytes: other_doc.doc().export(ExportMode::Snapshot).unwrap(),
        };
        let _ = snapshot;

        binding.apply_operations(&mut doc, &remote_ops);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        binding.set_broadcast_enabled(&doc, false);
        binding.apply_operations(&mut doc, &remote_ops);
        assert_eq!(count.load(Ordering::SeqCst), 1, "suppressed while broadcast disabled");

        binding.set_broadcast_enabled(&doc, true);
        binding.remove_listeners(&doc);
        binding.apply_operations(&mut doc, &remote_ops);
        assert_eq!(count.load(Ordering::SeqCst), 1, "no listeners left after remove_listeners");
    }
}
