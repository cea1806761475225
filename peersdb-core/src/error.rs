use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeersError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("you need a datastore first, try connecting to a peer")]
    NoDatastore,

    #[error("store not found: {0}")]
    StoreNotFound(String),

    #[error("content not found: {0}")]
    ContentNotFound(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("write denied for {writer} on {address}")]
    WriteDenied { writer: String, address: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PeersError>;
