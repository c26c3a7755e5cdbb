// Engine-wide error types

use thiserror::Error;

/// All errors produced by lememoire.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Operation attempted before `initialize` completed
    #[error("engine not initialized")]
    NotInitialized,

    /// Provided embedding dimension does not match the configured dimension
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected dimension
        expected: usize,
        /// Actual dimension received
        got: usize,
    },

    /// SQLite-backed store failure
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Filesystem failure during index persistence
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or snapshot (de)serialization failure
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// External embedding/generation call failed after retries
    #[error("{operation} failed after {attempts} attempts: {message}")]
    Encoder {
        /// The provider operation that failed
        operation: &'static str,
        /// Number of attempts made
        attempts: u32,
        /// Last observed failure
        message: String,
    },

    /// Could not acquire a flag lock within the allowed wait
    #[error("could not acquire {lock} lock within {waited_ms}ms")]
    LockTimeout {
        /// Name of the contended lock
        lock: &'static str,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// A record's content hash no longer matches its text
    #[error("integrity violation for record {id}")]
    IntegrityViolation {
        /// Id of the corrupted record
        id: String,
    },

    /// Missing text, bad options, or otherwise malformed caller input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// ANN index operation failure
    #[error("index error: {0}")]
    Index(String),

    /// Export encryption/decryption failure
    #[error("crypto error: {0}")]
    Crypto(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MemoryError>;
