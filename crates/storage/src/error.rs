use crate::record::{redact, TokenState};

/// All errors that can be returned by an EnvelopeStore implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict -- another transaction
    /// committed a newer version of the envelope first.
    #[error(
        "concurrent conflict on envelope {envelope_id}: expected version {expected_version}, found {actual_version}"
    )]
    ConcurrentConflict {
        envelope_id: String,
        expected_version: i64,
        actual_version: i64,
    },

    #[error("envelope not found: {envelope_id}")]
    EnvelopeNotFound { envelope_id: String },

    /// An envelope with this id already exists.
    #[error("envelope already exists: {envelope_id}")]
    AlreadyExists { envelope_id: String },

    #[error("token not found: {}", redact(.token))]
    TokenNotFound { token: String },

    /// A token with this value was already stored.
    #[error("token already exists: {}", redact(.token))]
    TokenExists { token: String },

    /// Compare-and-set on a token's state failed: the token was not in the
    /// state the caller expected. This is how double consumption surfaces.
    #[error("token {} is {actual:?}, expected {expected:?}", redact(.token))]
    TokenStateConflict {
        token: String,
        expected: TokenState,
        actual: TokenState,
    },

    /// A backend-specific storage error (lock poisoning, I/O, serialization).
    #[error("storage backend error: {0}")]
    Backend(String),
}
