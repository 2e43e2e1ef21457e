//! Error taxonomy, one enum per trait boundary.
//!
//! Mirrors the error-kind list in the spec: each kind maps to exactly one
//! variant somewhere below, grouped by the layer that raises it.

use thiserror::Error;

/// Errors raised by a [`crate::binding::DocBinding`].
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("unknown doc type: {0}")]
    UnknownType(String),

    #[error("doc type already registered: {0}")]
    DuplicateType(String),

    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
}

/// Errors raised by a [`crate::provider::ClientProvider`] or [`crate::provider::ServerProvider`].
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("operations exist for doc {0} with no snapshot")]
    OrphanOps(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Errors raised by a [`crate::transport::Transport`]. All treated as transient.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Per-RPC and handshake rejections carried inside protocol responses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("auth rejected: {0}")]
    AuthRejected(String),
}

/// Top-level error type returned from [`crate::client::DocSyncClient`],
/// [`crate::docstore::DocStore`], and [`crate::server_sync::ServerSync`]
/// public methods.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("environment error: {0}")]
    Environment(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
