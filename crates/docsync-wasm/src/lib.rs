//! WASM bindings for docsync-core.
//!
//! Provides the bridge between a JavaScript host and the Rust sync engine.
//!
//! # Architecture
//!
//! A JS host owns the actual editable document (typically via a separate
//! `loro-wasm` package) and hands this crate only opaque Loro update bytes;
//! this crate never interprets document content, matching `DocBinding`'s
//! contract on the native side.
//!
//! ```text
//! JavaScript                         WASM (Rust)
//! ──────────                         ───────────
//! host's loro-wasm doc ──bytes──> WasmDocSyncClient
//!                                        │
//!                                        ▼
//!                                 LoroBinding (import/export only)
//!                                        │
//!                                        ▼
//!                              InMemoryClientProvider (op queue)
//!                                        │
//!                                        ▼
//!                               WasmWsTransport ──WebSocket──> relay
//! ```
//!
//! `docsync-core`'s own `DocStore`/`ServerSync`/`client::DocSyncClient` are
//! native-only (they spawn via `tokio::spawn`, which needs a threaded
//! runtime this crate does not carry — see `DESIGN.md`, resolved Open
//! Question 7), so the cache and push/pull state machine below are a
//! from-scratch, single-threaded reimplementation of the same contract,
//! grounded on `docsync-core::docstore::DocStore` and
//! `docsync-core::server_sync::ServerSync`.
//!
//! **Note**: This crate only compiles for `wasm32` targets. When building
//! for native targets (e.g. during `cargo check --workspace`), this crate
//! provides no exports.

#[cfg(target_arch = "wasm32")]
mod ws_transport;

// ============================================================================
// All WASM-specific code is gated behind target_arch = "wasm32"
// This allows `cargo check --workspace` to succeed on native targets.
// ============================================================================

#[cfg(target_arch = "wasm32")]
mod wasm_impl {
    use super::ws_transport::WasmWsTransport;
    use docsync_core::{
        AuthPayload, ClientMessage, ClientProvider, ClientTransaction, DocType, DocumentId,
        EventBus, InMemoryClientProvider, LoroBinding, LoroHandle, LoroOperations, LoroSnapshot,
        ServerMessage, StoredDoc, Subscription, SyncEvent, TransactionMode,
    };
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};
    use std::rc::Rc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing_subscriber::layer::SubscriberExt;
    use wasm_bindgen::prelude::*;

    // ========== Callback Logger Layer ==========

    /// Store the logger callback in thread-local storage (WASM is single-threaded)
    thread_local! {
        static LOGGER_CALLBACK: RefCell<Option<js_sys::Function>> = const { RefCell::new(None) };
    }

    /// A tracing layer that invokes a JavaScript callback for each log event.
    struct JsCallbackLayer;

    impl<S> tracing_subscriber::Layer<S> for JsCallbackLayer
    where
        S: tracing::Subscriber,
    {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            LOGGER_CALLBACK.with(|cb| {
                if let Some(callback) = cb.borrow().as_ref() {
                    let metadata = event.metadata();
                    let level = metadata.level().as_str();
                    let target = metadata.target();

                    let mut visitor = MessageVisitor::default();
                    event.record(&mut visitor);
                    let message = visitor.message;

                    let timestamp = web_time::SystemTime::now()
                        .duration_since(web_time::UNIX_EPOCH)
                        .map(|d| d.as_millis() as f64)
                        .unwrap_or(0.0);

                    let js_event = js_sys::Object::new();
                    let _ = js_sys::Reflect::set(&js_event, &"level".into(), &level.into());
                    let _ = js_sys::Reflect::set(&js_event, &"target".into(), &target.into());
                    let _ = js_sys::Reflect::set(&js_event, &"message".into(), &message.into());
                    let _ = js_sys::Reflect::set(&js_event, &"timestamp".into(), &timestamp.into());

                    let _ = callback.call1(&JsValue::NULL, &js_event);
                }
            });
        }
    }

    /// Visitor to extract message from tracing event fields
    #[derive(Default)]
    struct MessageVisitor {
        message: String,
    }

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.message = format!("{:?}", value);
            } else if self.message.is_empty() {
                self.message.push_str(&format!("{}={:?}", field.name(), value));
            } else {
                self.message.push_str(&format!(" {}={:?}", field.name(), value));
            }
        }

        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            if field.name() == "message" {
                self.message = value.to_string();
            } else if self.message.is_empty() {
                self.message = format!("{}={}", field.name(), value);
            } else {
                self.message.push_str(&format!(" {}={}", field.name(), value));
            }
        }
    }

    /// Initialize the WASM module (sets up panic hook and tracing for better debugging).
    ///
    /// Accepts an optional configuration object:
    /// - `init()` - console-only logging (default)
    /// - `init({})` - console-only logging
    /// - `init({ logger: (event) => {...} })` - callback + console logging
    ///
    /// The logger callback receives events with: `{ level, target, message, timestamp }`
    #[wasm_bindgen]
    pub fn init(config: Option<js_sys::Object>) {
        console_error_panic_hook::set_once();

        let has_callback = config.as_ref().map_or(false, |cfg| {
            js_sys::Reflect::get(cfg, &"logger".into())
                .ok()
                .map_or(false, |v| v.is_function())
        });

        if has_callback {
            let callback = config
                .as_ref()
                .and_then(|cfg| js_sys::Reflect::get(cfg, &"logger".into()).ok())
                .and_then(|v| v.dyn_into::<js_sys::Function>().ok());

            if let Some(cb) = callback {
                LOGGER_CALLBACK.with(|cell| {
                    *cell.borrow_mut() = Some(cb);
                });
            }

            let console_layer = tracing_wasm::WASMLayer::new(
                tracing_wasm::WASMLayerConfigBuilder::new()
                    .set_max_level(tracing::Level::DEBUG)
                    .build(),
            );

            let subscriber = tracing_subscriber::registry()
                .with(JsCallbackLayer)
                .with(console_layer);

            tracing::subscriber::set_global_default(subscriber).ok();
        } else {
            tracing_wasm::set_as_global_default_with_config(
                tracing_wasm::WASMLayerConfigBuilder::new()
                    .set_max_level(tracing::Level::DEBUG)
                    .build(),
            );
        }

        log("docsync-wasm initialized");
    }

    /// Health check to verify WASM is working
    #[wasm_bindgen]
    pub fn health_check() -> u32 {
        42
    }

    /// Get version string
    #[wasm_bindgen]
    pub fn version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    #[wasm_bindgen]
    extern "C" {
        #[wasm_bindgen(js_namespace = console)]
        pub fn log(s: &str);

        #[wasm_bindgen(js_namespace = console, js_name = log)]
        pub fn log_val(v: &JsValue);

        #[wasm_bindgen(js_namespace = console)]
        pub fn error(s: &str);
    }

    // ========== WASM Subscription Handle ==========

    /// Subscription handle exposed to JavaScript.
    ///
    /// Call `dispose()` to unsubscribe, or let the JS garbage collector
    /// collect it (the Rust Drop will run via FinalizationRegistry).
    #[wasm_bindgen]
    pub struct WasmSubscription {
        inner: RefCell<Option<Subscription>>,
    }

    #[wasm_bindgen]
    impl WasmSubscription {
        /// Unsubscribe from events. Safe to call multiple times.
        pub fn dispose(&self) {
            self.inner.borrow_mut().take();
        }
    }

    // ========== WasmDocSyncClient ==========

    /// Bridges a Send+Sync-bound `DocBinding::on_change` callback into the
    /// single-threaded `Rc`/`RefCell` world the rest of this client lives
    /// in. `LoroBinding::on_change` (inherited from `DocBinding: Send +
    /// Sync`) requires `Box<dyn Fn(..) + Send + Sync>` unconditionally — no
    /// wasm32 relaxation exists for it, unlike `ClientProvider`/
    /// `ClientTransaction`. An `Rc<ClientInner>` captured directly in that
    /// closure would make the closure itself `!Send`, so the closure
    /// instead captures only `Copy` identifiers (`client_id`, `doc_id`) and
    /// looks the live client back up here.
    thread_local! {
        static CLIENTS: RefCell<HashMap<u64, Rc<ClientInner>>> = RefCell::new(HashMap::new());
    }
    static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

    fn with_client(id: u64, f: impl FnOnce(Rc<ClientInner>)) {
        let inner = CLIENTS.with(|c| c.borrow().get(&id).cloned());
        if let Some(inner) = inner {
            f(inner);
        }
    }

    struct CacheEntry {
        doc: LoroHandle,
        doc_type: DocType,
        ref_count: usize,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum PushState {
        Idle,
        Pushing,
        PushingWithPending,
    }

    /// The state a single `WasmDocSyncClient` needs, reimplementing
    /// `docsync_core::docstore::DocStore` (the doc cache) and
    /// `docsync_core::server_sync::ServerSync` (the push/pull state
    /// machine) combined, since both are native-only.
    struct ClientInner {
        client_id: u64,
        binding: LoroBinding,
        provider: InMemoryClientProvider<LoroOperations, LoroSnapshot>,
        transport: Rc<WasmWsTransport<LoroOperations, LoroSnapshot>>,
        events: Rc<EventBus>,
        cache: RefCell<HashMap<DocumentId, CacheEntry>>,
        push_states: RefCell<HashMap<DocumentId, PushState>>,
        subscriptions: RefCell<HashSet<DocumentId>>,
    }

    impl ClientInner {
        fn emit(&self, event: SyncEvent) {
            self.events.emit(event);
        }

        fn now_ms() -> f64 {
            web_time::SystemTime::now()
                .duration_since(web_time::UNIX_EPOCH)
                .map(|d| d.as_millis() as f64)
                .unwrap_or(0.0)
        }

        fn install_change_listener(self: &Rc<Self>, doc_id: DocumentId, doc: &LoroHandle) {
            let client_id = self.client_id;
            self.binding.on_change(
                doc,
                Box::new(move |batch: LoroOperations| {
                    with_client(client_id, |inner| {
                        let inner = Rc::clone(&inner);
                        wasm_bindgen_futures::spawn_local(async move {
                            inner.append_and_push(doc_id, batch).await;
                        });
                    });
                }),
            );
        }

        /// Load-or-create a doc, mirroring `DocStore::get_doc` without the
        /// cross-process broadcast channel (meaningless for one browser tab).
        async fn get_doc(self: &Rc<Self>, doc_type: DocType, id: Option<DocumentId>) -> Result<DocumentId, JsError> {
            let doc_id = id.unwrap_or_else(DocumentId::generate);

            if let Some(entry) = self.cache.borrow_mut().get_mut(&doc_id) {
                entry.ref_count += 1;
                self.probe(doc_id);
                return Ok(doc_id);
            }

            let mut tx = self
                .provider
                .begin(TransactionMode::ReadWrite)
                .await
                .map_err(|e| JsError::new(&e.to_string()))?;
            let stored = tx.get_serialized_doc(doc_id).await.map_err(|e| JsError::new(&e.to_string()))?;
            let ops = tx.get_operations(doc_id).await.map_err(|e| JsError::new(&e.to_string()))?;

            let doc = match stored {
                Some(StoredDoc { serialized_doc, .. }) => {
                    let mut doc = self.binding.deserialize(&serialized_doc).map_err(|e| JsError::new(&e.to_string()))?;
                    self.binding.set_broadcast_enabled(&doc, false);
                    for batch in &ops {
                        self.binding.apply_operations(&mut doc, batch);
                    }
                    self.binding.set_broadcast_enabled(&doc, true);
                    doc
                }
                None => {
                    if !ops.is_empty() {
                        return Err(JsError::new(&format!("orphan operations for doc {doc_id} with no snapshot")));
                    }
                    let (doc, _) = self.binding.new_doc(&doc_type, Some(doc_id)).map_err(|e| JsError::new(&e.to_string()))?;
                    let snapshot = self.binding.serialize(&doc);
                    tx.save_serialized_doc(StoredDoc { doc_id, serialized_doc: snapshot, clock: 0 })
                        .await
                        .map_err(|e| JsError::new(&e.to_string()))?;
                    doc
                }
            };
            tx.commit().await.map_err(|e| JsError::new(&e.to_string()))?;

            self.install_change_listener(doc_id, &doc);
            self.cache.borrow_mut().insert(doc_id, CacheEntry { doc, doc_type, ref_count: 1 });
            self.probe(doc_id);
            Ok(doc_id)
        }

        fn export_doc_bytes(&self, doc_id: DocumentId) -> Result<Vec<u8>, JsError> {
            let cache = self.cache.borrow();
            let entry = cache.get(&doc_id).ok_or_else(|| JsError::new("doc not cached"))?;
            Ok(self.binding.serialize(&entry.doc).bytes)
        }

        /// Import Loro update bytes produced by the JS host's own doc
        /// mirror. Treated identically to a remote batch by the binding —
        /// `on_change` still fires and the push loop still picks it up —
        /// since the binding never distinguishes "local" from "remote"
        /// itself (spec §4.2: that distinction lives entirely in whether
        /// `set_broadcast_enabled` was toggled around the call).
        fn apply_local_update(self: &Rc<Self>, doc_id: DocumentId, bytes: Vec<u8>) -> Result<(), JsError> {
            let doc_type = {
                let cache = self.cache.borrow();
                let entry = cache.get(&doc_id).ok_or_else(|| JsError::new("doc not cached"))?;
                entry.doc_type.clone()
            };
            let ops = LoroOperations { doc_type, bytes };
            let mut cache = self.cache.borrow_mut();
            let entry = cache.get_mut(&doc_id).ok_or_else(|| JsError::new("doc not cached"))?;
            self.binding.apply_operations(&mut entry.doc, &ops);
            drop(cache);
            self.emit(SyncEvent::DocumentUpdated { doc_id, timestamp: Self::now_ms() });
            Ok(())
        }

        fn apply_remote_batch(&self, doc_id: DocumentId, batch: &LoroOperations) {
            let mut cache = self.cache.borrow_mut();
            let Some(entry) = cache.get_mut(&doc_id) else { return };
            self.binding.set_broadcast_enabled(&entry.doc, false);
            self.binding.apply_operations(&mut entry.doc, batch);
            self.binding.set_broadcast_enabled(&entry.doc, true);
        }

        fn apply_remote_snapshot(&self, doc_id: DocumentId, snapshot: &LoroSnapshot) {
            let mut cache = self.cache.borrow_mut();
            let Some(entry) = cache.get_mut(&doc_id) else { return };
            self.binding.set_broadcast_enabled(&entry.doc, false);
            self.binding.apply_snapshot(&mut entry.doc, snapshot);
            self.binding.set_broadcast_enabled(&entry.doc, true);
        }

        fn release_doc(self: &Rc<Self>, doc_id: DocumentId) {
            let drop_entry = {
                let mut cache = self.cache.borrow_mut();
                match cache.get_mut(&doc_id) {
                    Some(entry) => {
                        entry.ref_count = entry.ref_count.saturating_sub(1);
                        if entry.ref_count == 0 {
                            cache.remove(&doc_id);
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                }
            };
            if drop_entry {
                self.subscriptions.borrow_mut().remove(&doc_id);
                let request_id = self.transport.next_request_id();
                let transport = Rc::clone(&self.transport);
                wasm_bindgen_futures::spawn_local(async move {
                    let _ = transport.request(ClientMessage::Unsubscribe { request_id, doc_id }).await;
                });
            }
        }

        fn probe(self: &Rc<Self>, doc_id: DocumentId) {
            self.subscriptions.borrow_mut().insert(doc_id);
            let this = Rc::clone(self);
            wasm_bindgen_futures::spawn_local(async move {
                let request_id = this.transport.next_request_id();
                let _ = this.transport.request(ClientMessage::Subscribe { request_id, doc_id }).await;
                this.save_remote(doc_id, true).await;
            });
        }

        async fn append_and_push(self: Rc<Self>, doc_id: DocumentId, batch: LoroOperations) {
            if let Ok(mut tx) = self.provider.begin(TransactionMode::ReadWrite).await {
                if tx.save_operations(doc_id, vec![batch]).await.is_ok() {
                    let _ = tx.commit().await;
                }
            }
            self.save_remote(doc_id, false).await;
        }

        /// At most one in-flight push per doc (spec I4); a call that lands
        /// while a push is in flight coalesces into a single follow-up.
        async fn save_remote(self: Rc<Self>, doc_id: DocumentId, forced: bool) {
            let mut states = self.push_states.borrow_mut();
            let state = states.entry(doc_id).or_insert(PushState::Idle);
            match state {
                PushState::Idle => {
                    *state = PushState::Pushing;
                    drop(states);
                    let this = Rc::clone(&self);
                    wasm_bindgen_futures::spawn_local(async move { this.do_push(doc_id, forced).await });
                }
                PushState::Pushing => {
                    *state = PushState::PushingWithPending;
                }
                PushState::PushingWithPending => {}
            }
        }

        async fn do_push(self: Rc<Self>, doc_id: DocumentId, mut forced: bool) {
            let mut attempt: u32 = 0;
            loop {
                let (batches, clock) = match self.read_pending(doc_id).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(%doc_id, error = %e, "failed to read local op log for push");
                        self.finish_or_loop(doc_id).await;
                        return;
                    }
                };

                if batches.is_empty() && !forced {
                    self.finish_or_loop(doc_id).await;
                    return;
                }

                let request_id = self.transport.next_request_id();
                let operations = if batches.is_empty() { None } else { Some(batches.clone()) };
                let msg = ClientMessage::SyncOperations { request_id, doc_id, operations, clock };

                match self.transport.request(msg).await {
                    Ok(ServerMessage::SyncOperationsResult { clock: new_clock, operations, serialized_doc, .. }) => {
                        self.consolidate(doc_id, batches.len(), new_clock, operations, serialized_doc).await;
                        self.emit(SyncEvent::PushOutcome { doc_id, attempt, success: true, timestamp: Self::now_ms() });
                        forced = false;
                        attempt = 0;
                        self.finish_or_loop(doc_id).await;
                        return;
                    }
                    Ok(ServerMessage::Error { error, .. }) => {
                        tracing::warn!(%doc_id, %error, "push rejected by relay");
                        self.emit(SyncEvent::PushOutcome { doc_id, attempt, success: false, timestamp: Self::now_ms() });
                        self.finish_or_loop(doc_id).await;
                        return;
                    }
                    Ok(_) => {
                        tracing::warn!(%doc_id, "unexpected response to sync-operations");
                        self.finish_or_loop(doc_id).await;
                        return;
                    }
                    Err(e) => {
                        self.emit(SyncEvent::PushOutcome { doc_id, attempt, success: false, timestamp: Self::now_ms() });
                        let delay = ws_transport_backoff(attempt);
                        tracing::debug!(%doc_id, %e, attempt, "push retry after transport error");
                        ws_transport_sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        }

        async fn read_pending(&self, doc_id: DocumentId) -> Result<(Vec<LoroOperations>, docsync_core::Clock), JsError> {
            let mut tx = self.provider.begin(TransactionMode::ReadOnly).await.map_err(|e| JsError::new(&e.to_string()))?;
            let batches = tx.get_operations(doc_id).await.map_err(|e| JsError::new(&e.to_string()))?;
            let clock = tx
                .get_serialized_doc(doc_id)
                .await
                .map_err(|e| JsError::new(&e.to_string()))?
                .map(|s| s.clock)
                .unwrap_or(0);
            Ok((batches, clock))
        }

        async fn consolidate(
            &self,
            doc_id: DocumentId,
            pushed_count: usize,
            new_clock: docsync_core::Clock,
            operations: Vec<LoroOperations>,
            serialized_doc: Option<LoroSnapshot>,
        ) {
            let Ok(mut tx) = self.provider.begin(TransactionMode::ReadWrite).await else { return };
            let _ = tx.delete_operations(doc_id, pushed_count).await;

            if let Some(snapshot) = &serialized_doc {
                self.apply_remote_snapshot(doc_id, snapshot);
                self.emit(SyncEvent::DocSquashed { doc_id, timestamp: Self::now_ms() });
                let _ = tx.save_serialized_doc(StoredDoc { doc_id, serialized_doc: snapshot.clone(), clock: new_clock }).await;
            } else {
                for batch in &operations {
                    self.apply_remote_batch(doc_id, batch);
                }
                if let Some(bytes) = self.export_doc_bytes(doc_id).ok() {
                    let cache = self.cache.borrow();
                    if let Some(entry) = cache.get(&doc_id) {
                        let snapshot = LoroSnapshot { doc_type: entry.doc_type.clone(), bytes };
                        drop(cache);
                        let _ = tx.save_serialized_doc(StoredDoc { doc_id, serialized_doc: snapshot, clock: new_clock }).await;
                    }
                }
            }

            let _ = tx.commit().await;
        }

        async fn finish_or_loop(self: Rc<Self>, doc_id: DocumentId) {
            let next = {
                let mut states = self.push_states.borrow_mut();
                match states.get(&doc_id) {
                    Some(PushState::PushingWithPending) => {
                        states.insert(doc_id, PushState::Pushing);
                        true
                    }
                    _ => {
                        states.insert(doc_id, PushState::Idle);
                        false
                    }
                }
            };
            if next {
                let this = Rc::clone(&self);
                wasm_bindgen_futures::spawn_local(async move { this.do_push(doc_id, false).await });
            }
        }

        async fn replay_subscriptions(self: Rc<Self>) {
            let doc_ids: Vec<DocumentId> = self.subscriptions.borrow().iter().copied().collect();
            for doc_id in doc_ids {
                let request_id = self.transport.next_request_id();
                let _ = self.transport.request(ClientMessage::Subscribe { request_id, doc_id }).await;
                Rc::clone(&self).save_remote(doc_id, true).await;
            }
        }
    }

    fn ws_transport_backoff(attempt: u32) -> f64 {
        // Shares `ws_transport`'s reconnect backoff formula rather than
        // duplicating the jitter math for push retries.
        super::ws_transport::full_jitter_backoff_ms(attempt)
    }

    async fn ws_transport_sleep(ms: f64) {
        super::ws_transport::sleep_ms(ms).await
    }

    /// Document sync client exposed to JavaScript. Wraps the client-side
    /// sync engine (cache + push/pull state machine + relay transport)
    /// behind a narrow, Promise-returning API.
    #[wasm_bindgen]
    pub struct WasmDocSyncClient {
        inner: Rc<ClientInner>,
    }

    #[wasm_bindgen]
    impl WasmDocSyncClient {
        /// Connect to a relay and register the doc types this client will
        /// work with. `peer_id` seeds every Loro doc this client creates or
        /// imports into (spec requires a stable peer id per device/tab).
        #[wasm_bindgen(constructor)]
        pub fn new(relay_url: String, doc_types: Vec<String>, peer_id: u64) -> Result<WasmDocSyncClient, JsError> {
            let binding = LoroBinding::new(doc_types.into_iter().map(DocType::new), peer_id)
                .map_err(|e| JsError::new(&e.to_string()))?;
            let provider = InMemoryClientProvider::new();
            let transport = WasmWsTransport::connect(relay_url);
            let events = Rc::new(EventBus::new());
            let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);

            let inner = Rc::new(ClientInner {
                client_id,
                binding,
                provider,
                transport: Rc::clone(&transport),
                events,
                cache: RefCell::new(HashMap::new()),
                push_states: RefCell::new(HashMap::new()),
                subscriptions: RefCell::new(HashSet::new()),
            });
            CLIENTS.with(|c| c.borrow_mut().insert(client_id, Rc::clone(&inner)));

            let reconnect = Rc::clone(&inner);
            transport.on_connect(move || {
                let reconnect = Rc::clone(&reconnect);
                wasm_bindgen_futures::spawn_local(async move { reconnect.replay_subscriptions().await });
            });

            let dirty = Rc::clone(&inner);
            transport.on_push(move |msg| {
                if let ServerMessage::Dirty { doc_id } = msg {
                    let dirty = Rc::clone(&dirty);
                    dirty.emit(SyncEvent::DirtyReceived { doc_id, timestamp: ClientInner::now_ms() });
                    wasm_bindgen_futures::spawn_local(async move { Rc::clone(&dirty).save_remote(doc_id, true).await });
                }
            });

            Ok(WasmDocSyncClient { inner })
        }

        /// Authenticate this connection. Must be called before any doc
        /// operation; the relay rejects `SyncOperations` from an
        /// unauthenticated socket (spec §6.1).
        #[wasm_bindgen]
        pub async fn authenticate(&self, token: String, device_id: String) -> Result<bool, JsError> {
            let request_id = self.inner.transport.next_request_id();
            match self
                .inner
                .transport
                .request(ClientMessage::Authenticate { request_id, auth: AuthPayload { token, device_id } })
                .await
                .map_err(|e| JsError::new(&e.to_string()))?
            {
                ServerMessage::AuthResult { ok, .. } => Ok(ok),
                other => Err(JsError::new(&format!("unexpected response to authenticate: {other:?}"))),
            }
        }

        /// Load or create a doc. Pass `docId` to load an existing one;
        /// omit it to create a fresh doc of `docType`. Returns the
        /// resolved doc id.
        #[wasm_bindgen(js_name = getDoc)]
        pub async fn get_doc(&self, doc_type: String, doc_id: Option<String>) -> Result<String, JsError> {
            let id = doc_id.map(|s| s.parse()).transpose().map_err(|e| JsError::new(&e.to_string()))?;
            let doc_id = self.inner.get_doc(DocType::new(doc_type), id).await?;
            Ok(doc_id.to_string())
        }

        /// Export the cached doc's full current state as Loro snapshot
        /// bytes, for the JS host to import into its own mirror.
        #[wasm_bindgen(js_name = exportSnapshot)]
        pub fn export_snapshot(&self, doc_id: String) -> Result<Vec<u8>, JsError> {
            let doc_id = doc_id.parse().map_err(|e| JsError::new(&e.to_string()))?;
            self.inner.export_doc_bytes(doc_id)
        }

        /// Import Loro update bytes produced by a local edit in the JS
        /// host's own document mirror. Queues the batch for push and
        /// returns immediately; the push itself runs in the background.
        #[wasm_bindgen(js_name = applyLocalUpdate)]
        pub fn apply_local_update(&self, doc_id: String, bytes: Vec<u8>) -> Result<(), JsError> {
            let doc_id = doc_id.parse().map_err(|e| JsError::new(&e.to_string()))?;
            self.inner.apply_local_update(doc_id, bytes)
        }

        /// Release this client's interest in a doc. Once the last
        /// reference is released, the cache entry is dropped and the
        /// relay subscription is torn down.
        #[wasm_bindgen(js_name = releaseDoc)]
        pub fn release_doc(&self, doc_id: String) -> Result<(), JsError> {
            let doc_id = doc_id.parse().map_err(|e| JsError::new(&e.to_string()))?;
            self.inner.release_doc(doc_id);
            Ok(())
        }

        /// Permanently delete a doc on the relay. Backs the spec's
        /// `DeleteDoc` RPC.
        #[wasm_bindgen(js_name = deleteDoc)]
        pub async fn delete_doc(&self, doc_id: String) -> Result<bool, JsError> {
            let doc_id: DocumentId = doc_id.parse().map_err(|e| JsError::new(&e.to_string()))?;
            let request_id = self.inner.transport.next_request_id();
            match self
                .inner
                .transport
                .request(ClientMessage::DeleteDoc { request_id, doc_id })
                .await
                .map_err(|e| JsError::new(&e.to_string()))?
            {
                ServerMessage::DeleteDocResult { success, .. } => Ok(success),
                other => Err(JsError::new(&format!("unexpected response to delete_doc: {other:?}"))),
            }
        }

        /// Broadcast a presence patch for a doc. Pass `null` (via
        /// `JsValue::NULL`) fields are handled relay-side; disconnects
        /// clear presence automatically.
        #[wasm_bindgen(js_name = sendPresence)]
        pub async fn send_presence(&self, doc_id: String, presence: JsValue) -> Result<(), JsError> {
            let doc_id: DocumentId = doc_id.parse().map_err(|e| JsError::new(&e.to_string()))?;
            let presence: serde_json::Value =
                serde_wasm_bindgen::from_value(presence).map_err(|e| JsError::new(&e.to_string()))?;
            let request_id = self.inner.transport.next_request_id();
            let _ = self
                .inner
                .transport
                .request(ClientMessage::Presence { request_id, doc_id, presence })
                .await;
            Ok(())
        }

        /// Subscribe to sync events for real-time monitoring.
        ///
        /// Returns a `WasmSubscription` handle. Call `dispose()` on it to
        /// unsubscribe, or let the JS garbage collector clean it up.
        #[wasm_bindgen(js_name = subscribeEvents)]
        pub fn subscribe_events(&self, callback: js_sys::Function) -> WasmSubscription {
            let rust_closure = move |event: SyncEvent| {
                if let Ok(js_event) = serde_wasm_bindgen::to_value(&event) {
                    let _ = callback.call1(&wasm_bindgen::JsValue::NULL, &js_event);
                }
            };
            WasmSubscription {
                inner: RefCell::new(Some(self.inner.events.subscribe(rust_closure))),
            }
        }

        /// Detach this client from the thread-local registry its own
        /// `DocBinding::on_change` callbacks resolve through. Call before
        /// dropping the last JS reference to avoid leaking the `Rc` cycle
        /// the registry otherwise holds open.
        #[wasm_bindgen]
        pub fn dispose(&self) {
            CLIENTS.with(|c| c.borrow_mut().remove(&self.inner.client_id));
        }
    }
}

// Re-export wasm_impl contents at crate root for wasm32 targets
#[cfg(target_arch = "wasm32")]
pub use wasm_impl::*;
