//! Event infrastructure for the client sync engine.
//!
//! Provides `SyncEvent` for debug/monitoring and `EventBus` for subscriptions.
//! Platform-specific implementations handle thread safety:
//! - Native: `Arc<EventBus>` with `RwLock` for multi-threaded Tokio runtime
//! - WASM: `Rc<EventBus>` with `RefCell` for single-threaded browser environment

use serde::Serialize;

use crate::ids::DocumentId;

/// Sync events emitted during sync operations for real-time monitoring
/// (e.g. a devtools panel or a WASM host's debug overlay).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Outgoing wire message prepared for the relay.
    MessageSent {
        #[serde(rename = "messageType")]
        message_type: String,
        doc_id: Option<DocumentId>,
        size: usize,
        timestamp: f64,
    },
    /// Incoming wire message received from the relay.
    MessageReceived {
        #[serde(rename = "messageType")]
        message_type: String,
        doc_id: Option<DocumentId>,
        size: usize,
        timestamp: f64,
    },
    /// A doc's local cache entry changed, whether from a local edit or an
    /// applied remote batch.
    DocumentUpdated { doc_id: DocumentId, timestamp: f64 },
    /// Outcome of one push attempt for a doc (spec §4.3: P1-P4, P8).
    PushOutcome {
        doc_id: DocumentId,
        attempt: u32,
        success: bool,
        timestamp: f64,
    },
    /// A server `dirty` notification arrived for a subscribed doc (spec §8 P9).
    DirtyReceived { doc_id: DocumentId, timestamp: f64 },
    /// The server squashed a doc's op log into a fresh snapshot (spec §4.4.2).
    DocSquashed { doc_id: DocumentId, timestamp: f64 },
}

// ============================================================================
// Native (multi-threaded) implementation
// ============================================================================
//
// A doc under active editing can emit several `SyncEvent`s per commit
// (a `DocumentUpdated`, a `PushOutcome` once the push settles, maybe a
// `DirtyReceived` from another tab in the same breath); a bulk reconnect
// replaying dozens of queued batches multiplies that further. Watcher id and
// the watcher list live behind one lock rather than an atomic counter plus a
// separately-locked `Vec`, since every mutation touches both together and a
// split would only buy parallelism nothing here needs.

#[cfg(not(target_arch = "wasm32"))]
mod platform {
    use super::*;
    use std::sync::{Arc, RwLock, Weak};

    type WatcherId = u64;

    struct Watchers {
        next_id: WatcherId,
        entries: Vec<(WatcherId, Arc<dyn Fn(SyncEvent) + Send + Sync>)>,
    }

    /// Subscription handle that unsubscribes automatically when dropped.
    ///
    /// Hold this value to keep receiving events; drop it to stop.
    pub struct Subscription {
        bus: Weak<EventBus>,
        id: WatcherId,
    }

    impl Drop for Subscription {
        fn drop(&mut self) {
            if let Some(bus) = self.bus.upgrade() {
                bus.unwatch(self.id);
            }
        }
    }

    /// Fan-out for [`SyncEvent`]s to any number of interested watchers
    /// (devtools panels, test assertions, a host app's own telemetry).
    /// Thread-safe; wrap in `Arc` to subscribe.
    pub struct EventBus {
        watchers: RwLock<Watchers>,
    }

    impl Default for EventBus {
        fn default() -> Self {
            Self {
                watchers: RwLock::new(Watchers { next_id: 0, entries: Vec::new() }),
            }
        }
    }

    impl EventBus {
        pub fn new() -> Self {
            Self::default()
        }

        /// Requires `self` to already be wrapped in `Arc`, so the returned
        /// `Subscription` can hold a weak back-reference for its `Drop`.
        pub fn subscribe(
            self: &Arc<Self>,
            watcher: impl Fn(SyncEvent) + Send + Sync + 'static,
        ) -> Subscription {
            let mut watchers = self.watchers.write().unwrap_or_else(|e| e.into_inner());
            let id = watchers.next_id;
            watchers.next_id += 1;
            watchers.entries.push((id, Arc::new(watcher)));
            drop(watchers);
            Subscription { bus: Arc::downgrade(self), id }
        }

        fn unwatch(&self, id: WatcherId) {
            // try_write: Drop can run mid-panic-unwind while emit still holds
            // a read guard on the same lock further up the stack.
            if let Ok(mut watchers) = self.watchers.try_write() {
                watchers.entries.retain(|(i, _)| *i != id);
            }
        }

        /// Fan an event out to every live watcher. A watcher that drops its
        /// own `Subscription` while handling an event, or subscribes a new
        /// one, is safe: the dispatch list is snapshotted before any watcher
        /// runs.
        pub fn emit(&self, event: SyncEvent) {
            let snapshot: Vec<_> = self
                .watchers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .entries
                .iter()
                .map(|(_, watcher)| Arc::clone(watcher))
                .collect();

            for watcher in snapshot {
                watcher(event.clone());
            }
        }
    }
}

// ============================================================================
// WASM (single-threaded) implementation
// ============================================================================

#[cfg(target_arch = "wasm32")]
mod platform {
    use super::*;
    use std::cell::RefCell;
    use std::rc::{Rc, Weak};

    type WatcherId = u64;

    struct Watchers {
        next_id: WatcherId,
        entries: Vec<(WatcherId, Rc<dyn Fn(SyncEvent)>)>,
    }

    /// Subscription handle that unsubscribes automatically when dropped.
    ///
    /// Hold this value to keep receiving events; drop it to stop.
    pub struct Subscription {
        bus: Weak<EventBus>,
        id: WatcherId,
    }

    impl Drop for Subscription {
        fn drop(&mut self) {
            if let Some(bus) = self.bus.upgrade() {
                bus.unwatch(self.id);
            }
        }
    }

    /// Fan-out for [`SyncEvent`]s to any number of interested watchers. The
    /// browser gives us one thread, so a `RefCell` is enough; wrap in `Rc`
    /// to subscribe.
    pub struct EventBus {
        watchers: RefCell<Watchers>,
    }

    impl Default for EventBus {
        fn default() -> Self {
            Self {
                watchers: RefCell::new(Watchers { next_id: 0, entries: Vec::new() }),
            }
        }
    }

    impl EventBus {
        pub fn new() -> Self {
            Self::default()
        }

        /// Requires `self` to already be wrapped in `Rc`, so the returned
        /// `Subscription` can hold a weak back-reference for its `Drop`.
        pub fn subscribe(self: &Rc<Self>, watcher: impl Fn(SyncEvent) + 'static) -> Subscription {
            let mut watchers = self.watchers.borrow_mut();
            let id = watchers.next_id;
            watchers.next_id += 1;
            watchers.entries.push((id, Rc::new(watcher)));
            drop(watchers);
            Subscription { bus: Rc::downgrade(self), id }
        }

        fn unwatch(&self, id: WatcherId) {
            self.watchers.borrow_mut().entries.retain(|(i, _)| *i != id);
        }

        /// Fan an event out to every live watcher, snapshotting the
        /// dispatch list first so a watcher reacting by subscribing or
        /// dropping its own `Subscription` mid-emit can't reenter the
        /// `RefCell` borrow.
        pub fn emit(&self, event: SyncEvent) {
            let snapshot: Vec<_> = self
                .watchers
                .borrow()
                .entries
                .iter()
                .map(|(_, watcher)| Rc::clone(watcher))
                .collect();

            for watcher in snapshot {
                watcher(event.clone());
            }
        }
    }
}

pub use platform::*;
