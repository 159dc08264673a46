//! Error types for sextant-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Datastore or file-store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// CBOR decode failure
    #[error("Decode error: {0}")]
    Decode(String),

    /// Malformed peer id
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Malformed content id or multihash
    #[error("Invalid cid: {0}")]
    InvalidCid(String),

    /// Signature verification failure
    #[error("Signature error: {0}")]
    Signature(String),

    /// The indexer is frozen and refusing new writes
    #[error("indexer is frozen")]
    Frozen,

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an I/O error
    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    /// Create an invalid peer id error
    pub fn invalid_peer_id(msg: impl Into<String>) -> Self {
        Error::InvalidPeerId(msg.into())
    }

    /// Create an invalid cid error
    pub fn invalid_cid(msg: impl Into<String>) -> Self {
        Error::InvalidCid(msg.into())
    }

    /// Create a signature error
    pub fn signature(msg: impl Into<String>) -> Self {
        Error::Signature(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// True if this error is a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<minicbor::decode::Error> for Error {
    fn from(e: minicbor::decode::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
