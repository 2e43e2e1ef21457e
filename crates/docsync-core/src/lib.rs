// Deny holding RefCell borrows across await points - causes WASM panics
#![deny(clippy::await_holding_refcell_ref)]

//! docsync-core: the client sync engine, document binding contract, and
//! wire protocol shared between the relay and every client (native or
//! wasm32).
//!
//! - [`binding`]/[`loro_binding`]: the narrow contract between the sync
//!   engine and a document model, plus a reference CRDT implementation.
//! - [`provider`]/[`memory_provider`]: local/server persistence traits and
//!   an in-memory reference implementation used throughout this crate's
//!   own tests.
//! - [`protocol`]/[`transport`]/[`transport_ws`]: the wire format and the
//!   bidirectional channel to the relay.
//! - [`docstore`]/[`server_sync`]/[`client`]: the in-memory doc cache, the
//!   per-doc push/pull state machine, and the façade wiring them together.
//!   Native-only — they spawn background work via `tokio::spawn`, which
//!   needs a threaded runtime `docsync-wasm` does not carry (see
//!   `DESIGN.md`, resolved Open Question 7).
//! - [`json_file_provider`]: a durable, on-disk `ClientProvider` reference
//!   implementation. Native-only — it shells out to `tokio::fs`.

pub mod binding;
pub mod error;
pub mod events;
pub mod ids;
pub mod loro_binding;
pub mod memory_provider;
pub mod protocol;
pub mod provider;
pub mod transport;

#[cfg(not(target_arch = "wasm32"))]
pub mod client;
#[cfg(not(target_arch = "wasm32"))]
pub mod docstore;
#[cfg(not(target_arch = "wasm32"))]
pub mod json_file_provider;
#[cfg(not(target_arch = "wasm32"))]
pub mod server_sync;
#[cfg(not(target_arch = "wasm32"))]
pub mod transport_ws;

pub use binding::{check_no_duplicate_types, DocBinding, ListenerId};
pub use error::{BindingError, ProviderError, RpcError, SyncError, TransportError};
pub use events::{EventBus, Subscription, SyncEvent};
pub use ids::{Clock, DocType, DocumentId};
pub use loro_binding::{LoroBinding, LoroHandle, LoroOperations, LoroSnapshot};
pub use memory_provider::{InMemoryClientProvider, InMemoryServerProvider, SquashFn};
pub use protocol::{AuthPayload, ClientMessage, GetDocPayload, RequestId, RequestIdGenerator, ServerMessage};
pub use provider::{ClientProvider, ClientTransaction, ServerProvider, StoredDoc, SyncRequest, SyncResponse, TransactionMode};
pub use transport::Transport;

#[cfg(not(target_arch = "wasm32"))]
pub use client::DocSyncClient;
#[cfg(not(target_arch = "wasm32"))]
pub use docstore::{broadcast_channel, BroadcastMessage, DocStore, GetDocArgs, GetDocResult, ServerSyncHandle};
#[cfg(not(target_arch = "wasm32"))]
pub use json_file_provider::JsonFileClientProvider;
#[cfg(not(target_arch = "wasm32"))]
pub use server_sync::ServerSync;
#[cfg(not(target_arch = "wasm32"))]
pub use transport_ws::WsTransport;
