//! Error types for the account layer.

use sos_core::{CircleError, CoreError};
use sos_engine::EngineError;
use sos_store::StoreError;
use thiserror::Error;

/// Errors that can occur during account operations.
#[derive(Debug, Error)]
pub enum AccountError {
    /// Core encoding or validation error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// A circle mutation or update was refused.
    #[error("circle error: {0}")]
    Circle(#[from] CircleError),

    /// Engine or transport error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// The account does not synchronize this view.
    #[error("unknown view: {0}")]
    UnknownView(String),

    /// This device must be a circle member for the operation.
    #[error("not a circle member")]
    NotAMember,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for account operations.
pub type Result<T> = std::result::Result<T, AccountError>;
