//! Common error types for MyVault.

use thiserror::Error;

/// Top-level error type for MyVault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// KDF cost, parallelism, output length, nonce length or chunk size out of range.
    ///
    /// Always raised before any expensive work starts.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Wrong password: the derived key did not match the verification tag.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// An AEAD tag did not verify.
    #[error("Ciphertext authentication failed")]
    AuthFailure,

    /// Header or chunk data is malformed, truncated or fails authentication.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected failure inside a cryptographic primitive.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Metadata store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted in the current state.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
