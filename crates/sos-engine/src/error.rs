//! Error types for the sync engine.

use thiserror::Error;

use sos_core::PeerId;

/// Errors that can occur during sync operations.
///
/// An error is always scoped to one peer; the engine keeps syncing with
/// everyone else.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The peer coder rejected a message or could not encode one.
    #[error("coder error: {0}")]
    Coder(#[from] sos_coder::CoderError),

    /// The data source or state store failed.
    #[error("store error: {0}")]
    Store(#[from] sos_store::StoreError),

    /// Core encoding or validation failed.
    #[error("core error: {0}")]
    Core(#[from] sos_core::CoreError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer is not part of this engine's peer set.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// The data source no longer holds items the local manifest lists.
    #[error("{0} items listed in the manifest are missing from the data source")]
    MissingItems(usize),

    /// An inbound payload exceeded the configured item limit.
    #[error("payload with {0} items exceeds the limit")]
    PayloadTooLarge(usize),

    /// Payload or snapshot could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A KVS key field contains the delimiter or is empty.
    #[error("invalid key field: {0:?}")]
    InvalidKeyField(String),

    /// The engine task has stopped.
    #[error("engine closed")]
    Closed,
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
